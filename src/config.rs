use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Per-stage execution modes plus the defaults applied to stages
/// that have no explicit entry.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub default_stage_timeout_secs: u64,
    #[serde(default)]
    pub stages: HashMap<String, StageModeConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            default_stage_timeout_secs: default_stage_timeout_secs(),
            stages: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StageModeConfig {
    /// Allow this stage to run alongside other ready stages.
    #[serde(default)]
    pub parallel: bool,
    /// In-flight sub-unit cap for fan-out stages.
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
}

/// Execution mode of one stage after defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMode {
    pub parallel: bool,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl SchedulerConfig {
    pub fn stage(&self, name: &str) -> StageMode {
        let entry = self.stages.get(name);
        StageMode {
            parallel: entry.map_or(false, |s| s.parallel),
            concurrency: entry
                .and_then(|s| s.concurrency)
                .unwrap_or(self.default_concurrency)
                .max(1),
            timeout: Duration::from_secs(
                entry
                    .and_then(|s| s.timeout_secs)
                    .unwrap_or(self.default_stage_timeout_secs),
            ),
        }
    }

    /// Builder-style override used when assembling pipelines in code.
    pub fn with_stage(mut self, name: &str, mode: StageModeConfig) -> Self {
        self.stages.insert(name.to_string(), mode);
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerificationConfig {
    #[serde(default = "default_per_backend_timeout_ms")]
    pub per_backend_timeout_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            per_backend_timeout_ms: default_per_backend_timeout_ms(),
        }
    }
}

impl VerificationConfig {
    pub fn per_backend_timeout(&self) -> Duration {
        Duration::from_millis(self.per_backend_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: BackendKind,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Known evidence adapters, selected by the `kind` key.
#[derive(Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    Wikipedia {
        #[serde(default = "default_wikipedia_endpoint")]
        endpoint: String,
        #[serde(default = "default_result_limit")]
        limit: u32,
    },
    FactCheck {
        api_key: String,
        #[serde(default = "default_fact_check_endpoint")]
        endpoint: String,
        language_code: Option<String>,
    },
    Http {
        url: String,
        api_key: Option<String>,
    },
}

// Manual Debug impl to avoid leaking API keys
impl std::fmt::Debug for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Wikipedia { endpoint, limit } => f
                .debug_struct("Wikipedia")
                .field("endpoint", endpoint)
                .field("limit", limit)
                .finish(),
            BackendKind::FactCheck {
                endpoint,
                language_code,
                ..
            } => f
                .debug_struct("FactCheck")
                .field("api_key", &"[REDACTED]")
                .field("endpoint", endpoint)
                .field("language_code", language_code)
                .finish(),
            BackendKind::Http { url, api_key } => f
                .debug_struct("Http")
                .field("url", url)
                .field("api_key", &api_key.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

/// Token bucket parameters. Free-tier services get small values.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_second: default_refill_per_second(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (F) that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Rolling window (W) the failure streak must fit in.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_concurrency() -> usize {
    2
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_per_backend_timeout_ms() -> u64 {
    5_000
}

fn default_enabled() -> bool {
    true
}

fn default_wikipedia_endpoint() -> String {
    "https://en.wikipedia.org/w/api.php".to_string()
}

fn default_fact_check_endpoint() -> String {
    "https://factchecktools.googleapis.com/v1alpha1/claims:search".to_string()
}

fn default_result_limit() -> u32 {
    5
}

fn default_capacity() -> u32 {
    5
}

fn default_refill_per_second() -> f64 {
    1.0
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("claimflow").required(false));
        }

        // Environment variable overrides with CLAIMFLOW_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("CLAIMFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.default_concurrency == 0 {
            return Err(AppError::Config(
                "scheduler.default_concurrency must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(AppError::Config("backend name must not be empty".to_string()));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(AppError::Config(format!(
                    "backend {} declared more than once",
                    backend.name
                )));
            }
            if backend.rate_limit.capacity == 0 {
                return Err(AppError::Config(format!(
                    "backend {}: rate_limit.capacity must be at least 1",
                    backend.name
                )));
            }
            let refill = backend.rate_limit.refill_per_second;
            if !(refill > 0.0) || !refill.is_finite() {
                return Err(AppError::Config(format!(
                    "backend {}: rate_limit.refill_per_second must be positive and finite",
                    backend.name
                )));
            }
            if backend.circuit_breaker.failure_threshold == 0 {
                return Err(AppError::Config(format!(
                    "backend {}: circuit_breaker.failure_threshold must be at least 1",
                    backend.name
                )));
            }
        }

        Ok(())
    }

    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }
}
