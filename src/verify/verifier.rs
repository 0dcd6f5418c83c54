use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::evidence::{EvidenceAggregator, EvidenceBackend, EvidenceResult};
use crate::metrics::Metrics;
use crate::verify::{Claim, Verdict, VerdictLabel};

/// Turns a claim into a verdict using every enabled backend.
pub struct ClaimVerifier {
    aggregator: Arc<EvidenceAggregator>,
    backends: Vec<Arc<dyn EvidenceBackend>>,
    per_backend_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl ClaimVerifier {
    pub fn new(
        aggregator: Arc<EvidenceAggregator>,
        backends: Vec<Arc<dyn EvidenceBackend>>,
        per_backend_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            aggregator,
            backends,
            per_backend_timeout,
            metrics,
        }
    }

    pub async fn verify(&self, claim: &Claim) -> Verdict {
        if let Some(reason) = &claim.rejected {
            self.metrics.verdict(VerdictLabel::Unverified);
            warn!(claim_id = %claim.id, reason = %reason, "Claim rejected at extraction");
            return Verdict::unverified(&claim.id).with_error(reason.clone());
        }

        let results = self
            .aggregator
            .aggregate(claim, &self.backends, self.per_backend_timeout)
            .await;
        let verdict = verdict_from_results(&claim.id, results);

        self.metrics.verdict(verdict.label);
        info!(
            claim_id = %claim.id,
            label = %verdict.label,
            evidence_count = verdict.evidence_count,
            backends_used = verdict.backends_used.len(),
            backends_failed = verdict.backends_failed.len(),
            confidence = verdict.confidence,
            "Claim verified"
        );

        verdict
    }
}

/// Pure verdict computation over sorted aggregation results.
///
/// Timeouts, errors, rate limiting and open circuits all count as a
/// failed backend with no evidence.
pub fn verdict_from_results(claim_id: &str, results: Vec<EvidenceResult>) -> Verdict {
    let (succeeded, failed): (Vec<&EvidenceResult>, Vec<&EvidenceResult>) =
        results.iter().partition(|r| r.is_success());

    let evidence_count: usize = succeeded.iter().map(|r| r.items.len()).sum();

    let label = if evidence_count >= 1 {
        VerdictLabel::Supported
    } else if !succeeded.is_empty() {
        VerdictLabel::Insufficient
    } else {
        VerdictLabel::Unverified
    };

    let n = evidence_count as f64;
    let confidence = (n / (n + 1.0)).clamp(0.0, 1.0);

    let backends_used = succeeded.iter().map(|r| r.backend.clone()).collect();
    let backends_failed = failed.iter().map(|r| r.backend.clone()).collect();

    Verdict {
        claim_id: claim_id.to_string(),
        evidence_count,
        backends_used,
        backends_failed,
        confidence,
        label,
        evidence: results,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceItem, EvidenceOutcome};
    use crate::resilience::BackendRegistry;

    fn result(backend: &str, outcome: EvidenceOutcome, items: usize) -> EvidenceResult {
        EvidenceResult {
            backend: backend.to_string(),
            items: (0..items).map(|i| EvidenceItem::titled(format!("item {i}"))).collect(),
            latency_ms: 10,
            outcome,
            error: None,
        }
    }

    #[test]
    fn test_supported_when_any_backend_has_evidence() {
        let verdict = verdict_from_results(
            "c1",
            vec![
                result("a", EvidenceOutcome::Success, 2),
                result("b", EvidenceOutcome::Timeout, 0),
                result("c", EvidenceOutcome::Success, 1),
            ],
        );
        assert_eq!(verdict.label, VerdictLabel::Supported);
        assert_eq!(verdict.evidence_count, 3);
        assert_eq!(verdict.backends_used, vec!["a", "c"]);
        assert_eq!(verdict.backends_failed, vec!["b"]);
        assert!((verdict.confidence - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_insufficient_when_backends_answer_without_evidence() {
        let verdict = verdict_from_results(
            "c1",
            vec![
                result("a", EvidenceOutcome::Success, 0),
                result("b", EvidenceOutcome::CircuitOpen, 0),
            ],
        );
        assert_eq!(verdict.label, VerdictLabel::Insufficient);
        assert_eq!(verdict.confidence, 0.0);
    }

    #[test]
    fn test_unverified_when_every_backend_failed() {
        let verdict = verdict_from_results(
            "c1",
            vec![
                result("a", EvidenceOutcome::Timeout, 0),
                result("b", EvidenceOutcome::CircuitOpen, 0),
                result("c", EvidenceOutcome::RateLimited, 0),
                result("d", EvidenceOutcome::Error, 0),
            ],
        );
        assert_eq!(verdict.label, VerdictLabel::Unverified);
        assert!(verdict.backends_used.is_empty());
        assert_eq!(verdict.backends_failed.len(), 4);
    }

    #[test]
    fn test_unverified_without_backends() {
        let verdict = verdict_from_results("c1", Vec::new());
        assert_eq!(verdict.label, VerdictLabel::Unverified);
    }

    #[test]
    fn test_confidence_is_monotonic_and_bounded() {
        let mut last = -1.0;
        for n in 0..50 {
            let verdict =
                verdict_from_results("c1", vec![result("a", EvidenceOutcome::Success, n)]);
            assert!(verdict.confidence > last);
            assert!((0.0..=1.0).contains(&verdict.confidence));
            last = verdict.confidence;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_without_backends_is_unverified() {
        let metrics = Arc::new(Metrics::new());
        let aggregator = Arc::new(EvidenceAggregator::new(
            Arc::new(BackendRegistry::default()),
            Arc::clone(&metrics),
        ));
        let verifier =
            ClaimVerifier::new(aggregator, Vec::new(), Duration::from_secs(5), Arc::clone(&metrics));

        let verdict = verifier.verify(&Claim::new("c1", "anything")).await;
        assert_eq!(verdict.label, VerdictLabel::Unverified);
        assert_eq!(metrics.snapshot().claims_unverified, 1);
    }
}
