//! In-process counters for stages, backend outcomes and verdicts.
//!
//! Every counter is also mirrored by a `tracing` event at the call site;
//! these exist so the totals can be read back without a log pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::evidence::EvidenceOutcome;
use crate::resilience::BackendSnapshot;
use crate::verify::VerdictLabel;
use crate::workflow::StageStatus;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    success: Counter,
    timeout: Counter,
    rate_limited: Counter,
    circuit_open: Counter,
    error: Counter,
    latency_ms_total: Counter,
}

impl OutcomeCounters {
    fn counter(&self, outcome: EvidenceOutcome) -> &Counter {
        match outcome {
            EvidenceOutcome::Success => &self.success,
            EvidenceOutcome::Timeout => &self.timeout,
            EvidenceOutcome::RateLimited => &self.rate_limited,
            EvidenceOutcome::CircuitOpen => &self.circuit_open,
            EvidenceOutcome::Error => &self.error,
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    stages_started: Counter,
    stages_ok: Counter,
    stages_partial: Counter,
    stages_failed: Counter,
    stages_skipped: Counter,
    stage_duration_ms_total: Counter,
    claims_supported: Counter,
    claims_insufficient: Counter,
    claims_unverified: Counter,
    backends: RwLock<BTreeMap<String, Arc<OutcomeCounters>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_started(&self) {
        self.stages_started.inc();
    }

    pub fn stage_finished(&self, status: StageStatus, duration_ms: u64) {
        match status {
            StageStatus::Ok => self.stages_ok.inc(),
            StageStatus::Partial => self.stages_partial.inc(),
            StageStatus::Failed => self.stages_failed.inc(),
            StageStatus::Skipped => self.stages_skipped.inc(),
        }
        self.stage_duration_ms_total.add(duration_ms);
    }

    pub fn backend_outcome(&self, backend: &str, outcome: EvidenceOutcome, latency_ms: u64) {
        let counters = self.backend_counters(backend);
        counters.counter(outcome).inc();
        counters.latency_ms_total.add(latency_ms);
    }

    pub fn verdict(&self, label: VerdictLabel) {
        match label {
            VerdictLabel::Supported => self.claims_supported.inc(),
            VerdictLabel::Insufficient => self.claims_insufficient.inc(),
            VerdictLabel::Unverified => self.claims_unverified.inc(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let backends = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    BackendOutcomeSnapshot {
                        success: c.success.get(),
                        timeout: c.timeout.get(),
                        rate_limited: c.rate_limited.get(),
                        circuit_open: c.circuit_open.get(),
                        error: c.error.get(),
                        latency_ms_total: c.latency_ms_total.get(),
                        circuit_transitions: 0,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            stages_started: self.stages_started.get(),
            stages_ok: self.stages_ok.get(),
            stages_partial: self.stages_partial.get(),
            stages_failed: self.stages_failed.get(),
            stages_skipped: self.stages_skipped.get(),
            stage_duration_ms_total: self.stage_duration_ms_total.get(),
            claims_supported: self.claims_supported.get(),
            claims_insufficient: self.claims_insufficient.get(),
            claims_unverified: self.claims_unverified.get(),
            circuit_transitions: 0,
            backends,
        }
    }

    fn backend_counters(&self, backend: &str) -> Arc<OutcomeCounters> {
        if let Some(c) = self
            .backends
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(backend)
        {
            return Arc::clone(c);
        }
        let mut backends = self
            .backends
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(backends.entry(backend.to_string()).or_default())
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BackendOutcomeSnapshot {
    pub success: u64,
    pub timeout: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub error: u64,
    pub latency_ms_total: u64,
    pub circuit_transitions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub stages_started: u64,
    pub stages_ok: u64,
    pub stages_partial: u64,
    pub stages_failed: u64,
    pub stages_skipped: u64,
    pub stage_duration_ms_total: u64,
    pub claims_supported: u64,
    pub claims_insufficient: u64,
    pub claims_unverified: u64,
    /// Breaker state changes summed over every backend.
    pub circuit_transitions: u64,
    pub backends: BTreeMap<String, BackendOutcomeSnapshot>,
}

impl MetricsSnapshot {
    /// Fold breaker transition counts into the snapshot.
    ///
    /// Breakers own their own counters; a backend that has transitioned
    /// but never been called still gets an entry.
    pub fn with_circuits(mut self, circuits: &[BackendSnapshot]) -> Self {
        for circuit in circuits {
            let transitions = circuit.circuit.transitions;
            self.circuit_transitions += transitions;
            self.backends
                .entry(circuit.backend.clone())
                .or_default()
                .circuit_transitions = transitions;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_outcomes_counted_per_backend() {
        let metrics = Metrics::new();
        metrics.backend_outcome("wiki", EvidenceOutcome::Success, 120);
        metrics.backend_outcome("wiki", EvidenceOutcome::Timeout, 5000);
        metrics.backend_outcome("factcheck", EvidenceOutcome::CircuitOpen, 0);

        let snapshot = metrics.snapshot();
        let wiki = &snapshot.backends["wiki"];
        assert_eq!(wiki.success, 1);
        assert_eq!(wiki.timeout, 1);
        assert_eq!(wiki.latency_ms_total, 5120);
        assert_eq!(snapshot.backends["factcheck"].circuit_open, 1);
    }

    #[test]
    fn test_stage_and_verdict_counters() {
        let metrics = Metrics::new();
        metrics.stage_started();
        metrics.stage_finished(StageStatus::Partial, 40);
        metrics.verdict(VerdictLabel::Unverified);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages_started, 1);
        assert_eq!(snapshot.stages_partial, 1);
        assert_eq!(snapshot.stage_duration_ms_total, 40);
        assert_eq!(snapshot.claims_unverified, 1);
    }

    #[test]
    fn test_circuit_transitions_folded_in() {
        let registry = crate::resilience::BackendRegistry::default();
        let flaky = registry.ensure("flaky").unwrap();
        registry.ensure("steady").unwrap();
        for _ in 0..3 {
            match flaky.breaker.try_acquire() {
                crate::resilience::Admission::Allowed(permit) => permit.record_failure(),
                crate::resilience::Admission::Rejected => panic!("breaker opened early"),
            }
        }

        let metrics = Metrics::new();
        metrics.backend_outcome("flaky", EvidenceOutcome::Error, 10);
        let snapshot = metrics.snapshot().with_circuits(&registry.snapshots());

        assert_eq!(snapshot.circuit_transitions, 1);
        assert_eq!(snapshot.backends["flaky"].circuit_transitions, 1);
        assert_eq!(snapshot.backends["flaky"].error, 1);
        assert_eq!(snapshot.backends["steady"].circuit_transitions, 0);
    }
}
