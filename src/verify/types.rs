use serde::{Deserialize, Serialize};

use crate::evidence::EvidenceResult;

/// An atomic factual assertion extracted from content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(default)]
    pub id: String,
    pub text: String,
    /// Stage that extracted this claim.
    #[serde(default)]
    pub source_stage: String,
    #[serde(default = "default_extraction_confidence")]
    pub extraction_confidence: f64,
    /// Why extraction could not accept this entry. Rejected claims are
    /// reported as unverified without querying any backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

fn default_extraction_confidence() -> f64 {
    1.0
}

impl Claim {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source_stage: String::new(),
            extraction_confidence: default_extraction_confidence(),
            rejected: None,
        }
    }

    pub fn rejected(id: impl Into<String>, text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            rejected: Some(reason.into()),
            ..Self::new(id, text)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictLabel {
    /// At least one successful backend returned evidence.
    Supported,
    /// Backends answered, but none had evidence.
    Insufficient,
    /// No backend answered.
    Unverified,
}

impl std::fmt::Display for VerdictLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictLabel::Supported => write!(f, "supported"),
            VerdictLabel::Insufficient => write!(f, "insufficient"),
            VerdictLabel::Unverified => write!(f, "unverified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub claim_id: String,
    pub evidence_count: usize,
    pub backends_used: Vec<String>,
    pub backends_failed: Vec<String>,
    pub confidence: f64,
    pub label: VerdictLabel,
    #[serde(default)]
    pub evidence: Vec<EvidenceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Verdict {
    /// Verdict for a claim whose verification never produced results.
    pub fn unverified(claim_id: &str) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            evidence_count: 0,
            backends_used: Vec::new(),
            backends_failed: Vec::new(),
            confidence: 0.0,
            label: VerdictLabel::Unverified,
            evidence: Vec::new(),
            error: None,
        }
    }

    /// Unverified verdict carrying the reason the claim was never checked.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
