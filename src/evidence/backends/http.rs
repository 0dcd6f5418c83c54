use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::evidence::backends::{check_status, transport_error, EvidenceBackend};
use crate::evidence::EvidenceItem;

/// Generic JSON evidence service.
///
/// `POST {url}` with `{"claim": "..."}`, expecting `{"items": [...]}`.
pub struct HttpBackend {
    name: String,
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(name: &str, client: Client, url: &str, api_key: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            client,
            url: url.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl EvidenceBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, claim_text: &str) -> Result<Vec<EvidenceItem>, BackendError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&EvidenceQuery { claim: claim_text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let body = check_status(&self.name, response)
            .await?
            .json::<EvidenceResponse>()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        Ok(body.items)
    }
}

#[derive(Debug, Serialize)]
struct EvidenceQuery<'a> {
    claim: &'a str,
}

#[derive(Debug, Deserialize)]
struct EvidenceResponse {
    #[serde(default)]
    items: Vec<EvidenceItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shape() {
        let body: EvidenceResponse = serde_json::from_str(
            r#"{"items":[{"title":"Report","url":"https://example.org/r"},{"title":"Note"}]}"#,
        )
        .unwrap();
        assert_eq!(body.items.len(), 2);
        assert_eq!(body.items[1], EvidenceItem::titled("Note"));
    }

    #[test]
    fn test_query_shape() {
        let json = serde_json::to_value(EvidenceQuery { claim: "water boils at 100C" }).unwrap();
        assert_eq!(json, serde_json::json!({"claim": "water boils at 100C"}));
    }
}
