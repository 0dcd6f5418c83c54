use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::BackendError;
use crate::evidence::backends::EvidenceBackend;
use crate::evidence::{EvidenceItem, EvidenceOutcome, EvidenceRequest, EvidenceResult};
use crate::metrics::Metrics;
use crate::resilience::{Admission, BackendRegistry};
use crate::verify::Claim;

/// Fans one claim out to every backend at once.
///
/// Each backend is gated by its circuit breaker, then its rate limiter,
/// then bounded by the per-backend deadline, so a claim never waits
/// longer than the slowest permitted call. Backend failures are
/// reported as outcomes, never as errors.
pub struct EvidenceAggregator {
    registry: Arc<BackendRegistry>,
    metrics: Arc<Metrics>,
}

impl EvidenceAggregator {
    pub fn new(registry: Arc<BackendRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    /// Query all `backends` concurrently; results are sorted by backend name.
    pub async fn aggregate(
        &self,
        claim: &Claim,
        backends: &[Arc<dyn EvidenceBackend>],
        per_backend_timeout: Duration,
    ) -> Vec<EvidenceResult> {
        let calls = backends.iter().map(|backend| {
            let request = EvidenceRequest::new(&claim.id, backend.name(), per_backend_timeout);
            self.query_backend(request, &claim.text, Arc::clone(backend))
        });

        let mut results = join_all(calls).await;
        results.sort_by(|a, b| a.backend.cmp(&b.backend));

        let evidence_count: usize = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.items.len())
            .sum();
        let backends_failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            claim_id = %claim.id,
            evidence_count,
            backends_used = results.len() - backends_failed,
            backends_failed,
            "Claim aggregation finished"
        );

        results
    }

    async fn query_backend(
        &self,
        request: EvidenceRequest,
        claim_text: &str,
        backend: Arc<dyn EvidenceBackend>,
    ) -> EvidenceResult {
        let started = Instant::now();

        let state = match self.registry.ensure(&request.backend) {
            Ok(state) => state,
            Err(e) => {
                return self.finish(
                    &request,
                    started,
                    EvidenceOutcome::Error,
                    Vec::new(),
                    Some(e.to_string()),
                );
            }
        };

        let permit = match state.breaker.try_acquire() {
            Admission::Allowed(permit) => permit,
            Admission::Rejected => {
                let error = BackendError::CircuitOpen(request.backend.clone());
                return self.finish(
                    &request,
                    started,
                    EvidenceOutcome::CircuitOpen,
                    Vec::new(),
                    Some(error.to_string()),
                );
            }
        };

        if !state.limiter.try_acquire() {
            // Not a health signal; frees the probe slot if this was one.
            drop(permit);
            let error = BackendError::RateLimited(request.backend.clone());
            return self.finish(
                &request,
                started,
                EvidenceOutcome::RateLimited,
                Vec::new(),
                Some(error.to_string()),
            );
        }

        if permit.is_probe() {
            debug!(
                backend = %request.backend,
                claim_id = %request.claim_id,
                "Sending half-open probe"
            );
        }

        let budget = request.remaining();
        match tokio::time::timeout(budget, backend.call(claim_text)).await {
            Ok(Ok(items)) => {
                permit.record_success();
                self.finish(&request, started, EvidenceOutcome::Success, items, None)
            }
            Ok(Err(e)) => {
                permit.record_failure();
                self.finish(
                    &request,
                    started,
                    EvidenceOutcome::Error,
                    Vec::new(),
                    Some(e.to_string()),
                )
            }
            Err(_) => {
                permit.record_failure();
                let error = BackendError::Timeout {
                    backend: request.backend.clone(),
                    after: budget,
                };
                self.finish(
                    &request,
                    started,
                    EvidenceOutcome::Timeout,
                    Vec::new(),
                    Some(error.to_string()),
                )
            }
        }
    }

    fn finish(
        &self,
        request: &EvidenceRequest,
        started: Instant,
        outcome: EvidenceOutcome,
        items: Vec<EvidenceItem>,
        error: Option<String>,
    ) -> EvidenceResult {
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.backend_outcome(&request.backend, outcome, latency_ms);

        match outcome {
            EvidenceOutcome::Success => debug!(
                backend = %request.backend,
                claim_id = %request.claim_id,
                attempt = request.attempt,
                items = items.len(),
                latency_ms,
                "Backend returned evidence"
            ),
            _ => warn!(
                backend = %request.backend,
                claim_id = %request.claim_id,
                attempt = request.attempt,
                outcome = %outcome,
                error = error.as_deref().unwrap_or(""),
                latency_ms,
                "Backend attempt failed"
            ),
        }

        EvidenceResult {
            backend: request.backend.clone(),
            items,
            latency_ms,
            outcome,
            error,
        }
    }
}
