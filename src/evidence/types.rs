use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// One piece of evidence returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Publisher rating, for fact-check style sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
}

impl EvidenceItem {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: None,
            snippet: None,
            rating: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceOutcome {
    Success,
    Timeout,
    RateLimited,
    CircuitOpen,
    Error,
}

impl EvidenceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceOutcome::Success => "success",
            EvidenceOutcome::Timeout => "timeout",
            EvidenceOutcome::RateLimited => "rate_limited",
            EvidenceOutcome::CircuitOpen => "circuit_open",
            EvidenceOutcome::Error => "error",
        }
    }
}

impl std::fmt::Display for EvidenceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one backend produced for one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceResult {
    pub backend: String,
    pub items: Vec<EvidenceItem>,
    pub latency_ms: u64,
    pub outcome: EvidenceOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvidenceResult {
    pub fn is_success(&self) -> bool {
        self.outcome == EvidenceOutcome::Success
    }
}

/// A single backend attempt for a claim.
#[derive(Debug, Clone)]
pub struct EvidenceRequest {
    pub claim_id: String,
    pub backend: String,
    pub attempt: u32,
    pub deadline: Instant,
}

impl EvidenceRequest {
    pub fn new(claim_id: &str, backend: &str, timeout: Duration) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            backend: backend.to_string(),
            attempt: 1,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
