//! Circuit breaker for a single evidence backend.
//!
//! Stops outbound calls to a backend that keeps failing:
//! - Closed: calls flow; F consecutive failures inside the window open it
//! - Open: every call is rejected until the cooldown elapses
//! - HalfOpen: exactly one probe call is admitted; its outcome decides
//!   between Closed and Open, everyone else is rejected meanwhile

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// When the current failure streak began.
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_transition: DateTime<Utc>,
}

pub struct CircuitBreaker {
    backend: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    transitions: AtomicU64,
}

/// Result of asking the breaker for permission to call.
pub enum Admission<'a> {
    Allowed(BreakerPermit<'a>),
    Rejected,
}

/// Permission to make one call.
///
/// Dropping a permit without recording an outcome frees the half-open
/// probe slot and leaves the breaker state untouched.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Point-in-time view for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
    pub transitions: u64,
}

impl CircuitBreaker {
    pub fn new(backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                streak_started: None,
                opened_at: None,
                probe_in_flight: false,
                last_transition: Utc::now(),
            }),
            transitions: AtomicU64::new(0),
        }
    }

    /// Current state, after applying any due open -> half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_cooldown(&mut inner);
        inner.state
    }

    /// Ask to make one call. Never blocks on the probe slot.
    pub fn try_acquire(&self) -> Admission<'_> {
        let mut inner = self.lock();
        self.check_cooldown(&mut inner);

        match inner.state {
            CircuitState::Closed => Admission::Allowed(BreakerPermit {
                breaker: self,
                probe: false,
                resolved: false,
            }),
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    debug!(backend = %self.backend, "Circuit breaker admitting probe");
                    Admission::Allowed(BreakerPermit {
                        breaker: self,
                        probe: true,
                        resolved: false,
                    })
                }
            }
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.check_cooldown(&mut inner);
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_transition: inner.last_transition,
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
            }
            CircuitState::HalfOpen if probe => {
                info!(backend = %self.backend, "Circuit breaker closing after successful probe");
                self.transition_to(&mut inner, CircuitState::Closed);
            }
            // Late result from a call admitted before the circuit opened.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                let window = self.config.window();
                if inner
                    .streak_started
                    .map_or(true, |started| now.duration_since(started) > window)
                {
                    inner.consecutive_failures = 0;
                    inner.streak_started = Some(now);
                }
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        backend = %self.backend,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if probe => {
                warn!(backend = %self.backend, "Circuit breaker re-opening after failed probe");
                self.transition_to(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn check_cooldown(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if opened_at.elapsed() >= self.config.cooldown() {
            info!(
                backend = %self.backend,
                "Circuit breaker transitioning to half-open after cooldown"
            );
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    fn transition_to(&self, inner: &mut Inner, new_state: CircuitState) {
        debug!(
            backend = %self.backend,
            from = %inner.state,
            to = %new_state,
            "Circuit breaker transition"
        );
        inner.state = new_state;
        inner.last_transition = Utc::now();
        inner.probe_in_flight = false;
        self.transitions.fetch_add(1, Ordering::Relaxed);

        match new_state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked: every mutation
        // is a plain field write.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
