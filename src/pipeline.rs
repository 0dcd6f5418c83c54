//! Reference claim pipeline: extraction, per-claim verification, integration.
//!
//! Extraction normalises the claims handed in by the caller. Verification
//! fans out one unit per claim through the `ClaimVerifier`. Integration
//! folds the verdicts into a summary and tolerates a partially verified run.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::SchedulerConfig;
use crate::error::{SchedulerConfigError, StageError};
use crate::verify::{Claim, ClaimVerifier, Verdict, VerdictLabel};
use crate::workflow::{
    InputSource, StageDefinition, StageInputs, StageWork, WorkUnit, WorkflowRun, WorkflowScheduler,
};

pub const EXTRACTION: &str = "extraction";
pub const VERIFICATION: &str = "verification";
pub const INTEGRATION: &str = "integration";

pub struct ClaimPipeline {
    verifier: Arc<ClaimVerifier>,
}

impl ClaimPipeline {
    pub fn new(verifier: Arc<ClaimVerifier>) -> Self {
        Self { verifier }
    }

    pub fn stages(&self) -> Vec<StageDefinition> {
        vec![
            StageDefinition::new(EXTRACTION, ExtractionStage),
            StageDefinition::new(
                VERIFICATION,
                VerificationStage {
                    verifier: Arc::clone(&self.verifier),
                },
            )
            .requires(EXTRACTION)
            .fan_out(InputSource::Stage(EXTRACTION.to_string()), "/claims"),
            StageDefinition::new(INTEGRATION, IntegrationStage).accepts_partial(VERIFICATION),
        ]
    }

    /// Run the pipeline over `input`, which must carry a `claims` array.
    pub async fn run(
        &self,
        scheduler: &WorkflowScheduler,
        config: &SchedulerConfig,
        tenant: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun, SchedulerConfigError> {
        scheduler
            .execute_with_cancel(tenant, &self.stages(), input, config, cancel)
            .await
    }
}

/// Accepts either bare strings or claim objects; assigns ids where missing.
///
/// Entries that are blank or malformed stay in the output as rejected
/// claims so each one still ends with a verdict.
struct ExtractionStage;

#[async_trait]
impl StageWork for ExtractionStage {
    async fn run(&self, _unit: WorkUnit, inputs: Arc<StageInputs>) -> anyhow::Result<Value> {
        let raw = inputs
            .initial
            .get("claims")
            .and_then(Value::as_array)
            .context("input has no claims array")?;

        let claims: Vec<Claim> = raw
            .iter()
            .enumerate()
            .map(|(i, entry)| extract_claim(i, entry))
            .collect();

        Ok(json!({ "claims": claims }))
    }
}

fn extract_claim(index: usize, entry: &Value) -> Claim {
    let fallback_id = || format!("claim-{}", index + 1);

    let parsed = match entry {
        Value::String(text) => Ok(Claim::new(String::new(), text.clone())),
        other => serde_json::from_value::<Claim>(other.clone()),
    };

    let mut claim = match parsed {
        Ok(claim) => claim,
        Err(e) => {
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(fallback_id);
            warn!(index, claim_id = %id, error = %e, "Malformed claim");
            let mut claim =
                Claim::rejected(id, entry.to_string(), format!("claim {index} is malformed: {e}"));
            claim.source_stage = EXTRACTION.to_string();
            return claim;
        }
    };

    if claim.id.is_empty() {
        claim.id = fallback_id();
    }
    claim.text = claim.text.trim().to_string();
    claim.source_stage = EXTRACTION.to_string();
    if claim.text.is_empty() {
        warn!(index, claim_id = %claim.id, "Empty claim");
        claim.rejected = Some(format!("claim {index} is empty"));
    }
    claim
}

struct VerificationStage {
    verifier: Arc<ClaimVerifier>,
}

#[async_trait]
impl StageWork for VerificationStage {
    async fn run(&self, unit: WorkUnit, _inputs: Arc<StageInputs>) -> anyhow::Result<Value> {
        let WorkUnit::Item { value, .. } = unit else {
            anyhow::bail!("verification runs per claim");
        };
        let claim: Claim = serde_json::from_value(value).context("unit is not a claim")?;
        let verdict = self.verifier.verify(&claim).await;
        Ok(serde_json::to_value(verdict)?)
    }

    /// A claim that could not be verified in time is still reported.
    fn on_unit_failure(&self, unit: &WorkUnit, _error: &StageError) -> Option<Value> {
        let id = unit.id()?;
        serde_json::to_value(Verdict::unverified(id)).ok()
    }
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct VerdictSummary {
    pub total: usize,
    pub supported: usize,
    pub insufficient: usize,
    pub unverified: usize,
}

impl VerdictSummary {
    fn count(&mut self, label: VerdictLabel) {
        self.total += 1;
        match label {
            VerdictLabel::Supported => self.supported += 1,
            VerdictLabel::Insufficient => self.insufficient += 1,
            VerdictLabel::Unverified => self.unverified += 1,
        }
    }
}

struct IntegrationStage;

#[async_trait]
impl StageWork for IntegrationStage {
    async fn run(&self, _unit: WorkUnit, inputs: Arc<StageInputs>) -> anyhow::Result<Value> {
        let verdicts: Vec<Verdict> = match inputs.payload(VERIFICATION) {
            Some(payload) => serde_json::from_value(payload.clone())
                .context("verification payload is not a verdict list")?,
            None => Vec::new(),
        };

        let mut summary = VerdictSummary::default();
        for verdict in &verdicts {
            summary.count(verdict.label);
        }

        Ok(json!({
            "summary": summary,
            "verdicts": verdicts,
            "degraded_inputs": inputs.degraded(),
        }))
    }
}
