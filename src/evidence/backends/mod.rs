pub mod fact_check;
pub mod http;
pub mod wikipedia;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, BackendConfig, BackendKind};
use crate::error::BackendError;
use crate::evidence::EvidenceItem;

/// Uniform interface over heterogeneous evidence services.
///
/// Implementations only talk to their service. Deadlines, throttling and
/// circuit breaking are applied around them by the aggregator.
#[async_trait]
pub trait EvidenceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, claim_text: &str) -> Result<Vec<EvidenceItem>, BackendError>;
}

/// Resolve one configured backend to its adapter.
pub fn build_backend(config: &BackendConfig, client: reqwest::Client) -> Arc<dyn EvidenceBackend> {
    match &config.kind {
        BackendKind::Wikipedia { endpoint, limit } => Arc::new(wikipedia::WikipediaBackend::new(
            &config.name,
            client,
            endpoint,
            *limit,
        )),
        BackendKind::FactCheck {
            api_key,
            endpoint,
            language_code,
        } => Arc::new(fact_check::FactCheckBackend::new(
            &config.name,
            client,
            endpoint,
            api_key,
            language_code.clone(),
        )),
        BackendKind::Http { url, api_key } => Arc::new(http::HttpBackend::new(
            &config.name,
            client,
            url,
            api_key.clone(),
        )),
    }
}

/// Resolve every enabled backend once, in configuration order.
pub fn build_backends(config: &AppConfig, client: reqwest::Client) -> Vec<Arc<dyn EvidenceBackend>> {
    config
        .enabled_backends()
        .map(|backend| {
            tracing::info!(backend = %backend.name, kind = ?backend.kind, "Registering evidence backend");
            build_backend(backend, client.clone())
        })
        .collect()
}

pub(crate) fn transport_error(backend: &str, message: impl std::fmt::Display) -> BackendError {
    BackendError::Transport {
        backend: backend.to_string(),
        message: message.to_string(),
    }
}

/// Turn a non-2xx response into a transport error carrying the body.
pub(crate) async fn check_status(
    backend: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(transport_error(
        backend,
        format!("API returned {status}: {}", truncate(&body, 200)),
    ))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
