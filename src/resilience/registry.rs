use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::{AppConfig, CircuitBreakerConfig, RateLimitConfig};
use crate::error::Result;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::resilience::rate_limiter::RateLimiter;

/// Health and throttle state for one backend, shared by every run.
pub struct BackendState {
    name: String,
    pub limiter: RateLimiter,
    pub breaker: CircuitBreaker,
}

impl BackendState {
    pub fn new(
        name: &str,
        rate_limit: RateLimitConfig,
        circuit_breaker: CircuitBreakerConfig,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            limiter: RateLimiter::new(rate_limit)?,
            breaker: CircuitBreaker::new(name, circuit_breaker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let rate_limit = self.limiter.config();
        BackendSnapshot {
            backend: self.name.clone(),
            capacity: rate_limit.capacity,
            refill_per_second: rate_limit.refill_per_second,
            tokens_admitted: self.limiter.admitted(),
            tokens_rejected: self.limiter.rejected(),
            circuit: self.breaker.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub backend: String,
    pub capacity: u32,
    pub refill_per_second: f64,
    pub tokens_admitted: u64,
    pub tokens_rejected: u64,
    pub circuit: CircuitSnapshot,
}

/// Process-wide backend state, injected wherever it is needed.
///
/// Backends without an explicit entry get the registry defaults on
/// first use.
pub struct BackendRegistry {
    states: RwLock<HashMap<String, Arc<BackendState>>>,
    default_rate_limit: RateLimitConfig,
    default_circuit_breaker: CircuitBreakerConfig,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), CircuitBreakerConfig::default())
    }
}

impl BackendRegistry {
    pub fn new(
        default_rate_limit: RateLimitConfig,
        default_circuit_breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            default_rate_limit,
            default_circuit_breaker,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let registry = Self::default();
        for backend in config.enabled_backends() {
            registry.register(&backend.name, backend.rate_limit, backend.circuit_breaker)?;
        }
        Ok(registry)
    }

    /// Register (or replace) the state for a backend.
    pub fn register(
        &self,
        name: &str,
        rate_limit: RateLimitConfig,
        circuit_breaker: CircuitBreakerConfig,
    ) -> Result<Arc<BackendState>> {
        let state = Arc::new(BackendState::new(name, rate_limit, circuit_breaker)?);
        self.write().insert(name.to_string(), Arc::clone(&state));
        Ok(state)
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendState>> {
        self.read().get(name).cloned()
    }

    /// Fetch the state for a backend, creating it from defaults if absent.
    pub fn ensure(&self, name: &str) -> Result<Arc<BackendState>> {
        if let Some(state) = self.get(name) {
            return Ok(state);
        }

        let mut states = self.write();
        if let Some(state) = states.get(name) {
            return Ok(Arc::clone(state));
        }
        let state = Arc::new(BackendState::new(
            name,
            self.default_rate_limit,
            self.default_circuit_breaker,
        )?);
        states.insert(name.to_string(), Arc::clone(&state));
        Ok(state)
    }

    /// Snapshots of every known backend, sorted by name.
    pub fn snapshots(&self) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<_> = self.read().values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshots
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<BackendState>>> {
        self.states.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<BackendState>>> {
        self.states.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_creates_once() {
        let registry = BackendRegistry::default();
        let a = registry.ensure("wiki").unwrap();
        let b = registry.ensure("wiki").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.limiter.config(), RateLimitConfig::default());
    }

    #[test]
    fn test_register_uses_backend_parameters() {
        let registry = BackendRegistry::default();
        registry
            .register(
                "paid",
                RateLimitConfig {
                    capacity: 50,
                    refill_per_second: 25.0,
                },
                CircuitBreakerConfig::default(),
            )
            .unwrap();

        let snapshot = &registry.snapshots()[0];
        assert_eq!(snapshot.backend, "paid");
        assert_eq!(snapshot.capacity, 50);
    }

    #[test]
    fn test_snapshots_sorted_by_name() {
        let registry = BackendRegistry::default();
        for name in ["zeta", "alpha", "mid"] {
            registry.ensure(name).unwrap();
        }
        let names: Vec<_> = registry
            .snapshots()
            .into_iter()
            .map(|s| s.backend)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let registry = BackendRegistry::default();
        let result = registry.register(
            "broken",
            RateLimitConfig {
                capacity: 0,
                refill_per_second: 1.0,
            },
            CircuitBreakerConfig::default(),
        );
        assert!(result.is_err());
        assert!(registry.get("broken").is_none());
    }

    #[test]
    fn test_from_config_reports_unusable_refill_rate() {
        let config = crate::config::AppConfig {
            backends: vec![crate::config::BackendConfig {
                name: "glacial".to_string(),
                enabled: true,
                kind: crate::config::BackendKind::Http {
                    url: "http://127.0.0.1:9/evidence".to_string(),
                    api_key: None,
                },
                rate_limit: RateLimitConfig {
                    capacity: 1,
                    refill_per_second: 1e-30,
                },
                circuit_breaker: CircuitBreakerConfig::default(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let result = BackendRegistry::from_config(&config);
        assert!(matches!(result, Err(crate::error::AppError::Config(_))));
    }
}
