use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::BackendError;
use crate::evidence::backends::{check_status, transport_error, EvidenceBackend};
use crate::evidence::EvidenceItem;

/// Google Fact Check Tools `claims:search`.
pub struct FactCheckBackend {
    name: String,
    client: Client,
    endpoint: String,
    api_key: String,
    language_code: Option<String>,
}

impl FactCheckBackend {
    pub fn new(
        name: &str,
        client: Client,
        endpoint: &str,
        api_key: &str,
        language_code: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            language_code,
        }
    }
}

#[async_trait]
impl EvidenceBackend for FactCheckBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, claim_text: &str) -> Result<Vec<EvidenceItem>, BackendError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("query", claim_text), ("key", self.api_key.as_str())]);
        if let Some(lang) = &self.language_code {
            request = request.query(&[("languageCode", lang.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let body = check_status(&self.name, response)
            .await?
            .json::<ClaimSearchResponse>()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        Ok(to_items(body))
    }
}

// The API returns `{}` when nothing matches.
#[derive(Debug, Default, Deserialize)]
struct ClaimSearchResponse {
    #[serde(default)]
    claims: Vec<FactCheckedClaim>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FactCheckedClaim {
    text: Option<String>,
    #[serde(default)]
    claim_review: Vec<ClaimReview>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimReview {
    publisher: Option<Publisher>,
    url: Option<String>,
    title: Option<String>,
    textual_rating: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Publisher {
    name: Option<String>,
}

fn to_items(response: ClaimSearchResponse) -> Vec<EvidenceItem> {
    response
        .claims
        .into_iter()
        .flat_map(|claim| {
            let text = claim.text;
            claim.claim_review.into_iter().map(move |review| {
                let publisher = review.publisher.and_then(|p| p.name);
                EvidenceItem {
                    title: review
                        .title
                        .or_else(|| publisher.clone())
                        .unwrap_or_else(|| "Fact check".to_string()),
                    url: review.url,
                    snippet: text.clone(),
                    rating: review.textual_rating,
                }
            })
        })
        .collect()
}
