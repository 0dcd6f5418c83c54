use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::evidence::backends::build_backends;
use crate::evidence::{EvidenceAggregator, EvidenceBackend};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pipeline::ClaimPipeline;
use crate::resilience::{BackendRegistry, BackendSnapshot};
use crate::verify::ClaimVerifier;
use crate::workflow::{RunManifest, WorkflowScheduler};

pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<BackendRegistry>,
    pub metrics: Arc<Metrics>,
    pub scheduler: WorkflowScheduler,
    pub pipeline: ClaimPipeline,
    /// Fired on shutdown; in-flight runs stop and fail.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("claimflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let backends = build_backends(&config, client);
        Self::with_backends(config, backends)
    }

    /// Build state around already-resolved backends.
    pub fn with_backends(
        config: AppConfig,
        backends: Vec<Arc<dyn EvidenceBackend>>,
    ) -> crate::error::Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(BackendRegistry::from_config(&config)?);
        let aggregator = Arc::new(EvidenceAggregator::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));
        let verifier = Arc::new(ClaimVerifier::new(
            aggregator,
            backends,
            config.verification.per_backend_timeout(),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            scheduler: WorkflowScheduler::new(Arc::clone(&metrics)),
            pipeline: ClaimPipeline::new(verifier),
            config,
            registry,
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run the claim pipeline once and return its manifest.
    pub async fn run_claims(&self, tenant: &str, input: Value) -> crate::error::Result<RunManifest> {
        let run = self
            .pipeline
            .run(
                &self.scheduler,
                &self.config.scheduler,
                tenant,
                input,
                self.shutdown.child_token(),
            )
            .await?;
        Ok(run.manifest())
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(create_run))
        .route("/backends", get(list_backends))
        .route("/metrics", get(metrics))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default = "default_tenant")]
    pub tenant: String,
    pub claims: Vec<Value>,
}

fn default_tenant() -> String {
    crate::workflow::scheduler::DEFAULT_TENANT.to_string()
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunManifest>, AppError> {
    if request.claims.is_empty() {
        return Err(AppError::BadRequest("claims must not be empty".to_string()));
    }

    tracing::info!(tenant = %request.tenant, claims = request.claims.len(), "Received run request");

    let manifest = state
        .run_claims(&request.tenant, json!({ "claims": request.claims }))
        .await?;
    Ok(Json(manifest))
}

async fn list_backends(State(state): State<Arc<AppState>>) -> Json<Vec<BackendSnapshot>> {
    Json(state.registry.snapshots())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot().with_circuits(&state.registry.snapshots()))
}

async fn health_check() -> &'static str {
    "ok"
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
            AppError::Scheduler(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, "Request rejected");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, BackendKind, CircuitBreakerConfig, RateLimitConfig};
    use crate::error::BackendError;
    use crate::evidence::EvidenceItem;
    use crate::workflow::RunStatus;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    struct Offline;

    #[async_trait]
    impl EvidenceBackend for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        async fn call(&self, _claim_text: &str) -> Result<Vec<EvidenceItem>, BackendError> {
            Err(BackendError::Transport {
                backend: "offline".to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn state() -> Arc<AppState> {
        let config = AppConfig {
            backends: vec![BackendConfig {
                name: "offline".to_string(),
                enabled: true,
                kind: BackendKind::Http {
                    url: "http://127.0.0.1:9/evidence".to_string(),
                    api_key: None,
                },
                rate_limit: RateLimitConfig::default(),
                circuit_breaker: CircuitBreakerConfig::default(),
            }],
            ..Default::default()
        };
        Arc::new(AppState::with_backends(config, vec![Arc::new(Offline) as Arc<dyn EvidenceBackend>]).unwrap())
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_run_with_total_backend_failure_reports_unverified() {
        let state = state();
        let manifest = state
            .run_claims("acme", json!({"claims": ["The sky is green"]}))
            .await
            .unwrap();

        assert_eq!(manifest.status, RunStatus::Completed);
        let terminal = manifest.terminal.unwrap();
        assert_eq!(terminal.payload["summary"]["unverified"], json!(1));
        assert_eq!(
            terminal.payload["verdicts"][0]["backends_failed"],
            json!(["offline"])
        );
    }

    #[tokio::test]
    async fn test_post_runs_returns_manifest() {
        let app = create_router(state());
        let response = app
            .oneshot(
                Request::post("/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"tenant":"acme","claims":["a claim"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let manifest = body_json(response).await;
        assert_eq!(manifest["tenant"], json!("acme"));
        assert_eq!(manifest["stages"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_post_runs_rejects_empty_claims() {
        let app = create_router(state());
        let response = app
            .oneshot(
                Request::post("/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"claims":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backends_endpoint_lists_configured_backends() {
        let app = create_router(state());
        let response = app
            .oneshot(Request::get("/backends").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let backends = body_json(response).await;
        assert_eq!(backends[0]["backend"], json!("offline"));
        assert_eq!(backends[0]["circuit"]["state"], json!("closed"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_reports_circuit_transitions() {
        let state = state();
        for _ in 0..3 {
            state
                .run_claims("acme", json!({"claims": ["The sky is green"]}))
                .await
                .unwrap();
        }

        let app = create_router(Arc::clone(&state));
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let metrics = body_json(response).await;
        assert_eq!(metrics["circuit_transitions"], json!(1));
        assert_eq!(metrics["backends"]["offline"]["circuit_transitions"], json!(1));
        assert_eq!(metrics["backends"]["offline"]["error"], json!(3));
    }
}
