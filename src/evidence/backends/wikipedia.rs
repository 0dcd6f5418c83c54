use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::BackendError;
use crate::evidence::backends::{check_status, transport_error, EvidenceBackend};
use crate::evidence::EvidenceItem;

/// Full-text search over a MediaWiki instance.
pub struct WikipediaBackend {
    name: String,
    client: Client,
    endpoint: String,
    limit: u32,
}

impl WikipediaBackend {
    pub fn new(name: &str, client: Client, endpoint: &str, limit: u32) -> Self {
        Self {
            name: name.to_string(),
            client,
            endpoint: endpoint.to_string(),
            limit: limit.max(1),
        }
    }

    fn page_url(&self, page_id: u64) -> String {
        // https://en.wikipedia.org/w/api.php -> https://en.wikipedia.org/?curid=N
        let base = self
            .endpoint
            .split("/w/")
            .next()
            .unwrap_or(self.endpoint.as_str());
        format!("{base}/?curid={page_id}")
    }

    fn to_items(&self, response: SearchResponse) -> Vec<EvidenceItem> {
        response
            .query
            .map(|q| q.search)
            .unwrap_or_default()
            .into_iter()
            .map(|hit| EvidenceItem {
                url: Some(self.page_url(hit.pageid)),
                snippet: Some(strip_markup(&hit.snippet)).filter(|s| !s.is_empty()),
                rating: None,
                title: hit.title,
            })
            .collect()
    }
}

#[async_trait]
impl EvidenceBackend for WikipediaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, claim_text: &str) -> Result<Vec<EvidenceItem>, BackendError> {
        let limit = self.limit.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("format", "json"),
                ("srsearch", claim_text),
                ("srlimit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let body = check_status(&self.name, response)
            .await?
            .json::<SearchResponse>()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        Ok(self.to_items(body))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    query: Option<SearchQuery>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
    pageid: u64,
    #[serde(default)]
    snippet: String,
}

/// Drop the `<span class="searchmatch">` highlighting MediaWiki adds.
fn strip_markup(snippet: &str) -> String {
    let mut out = String::with_capacity(snippet.len());
    let mut in_tag = false;
    for c in snippet.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&quot;", "\"").replace("&amp;", "&")
}
