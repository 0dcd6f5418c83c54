use std::time::Duration;

use thiserror::Error;

/// Failure of a single evidence backend call.
///
/// These never leave the aggregator; they become an `EvidenceResult` outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend {backend} timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    #[error("Backend {0} rate limited")]
    RateLimited(String),

    #[error("Backend {0} circuit open")]
    CircuitOpen(String),

    #[error("Backend {backend} transport error: {message}")]
    Transport { backend: String, message: String },
}

/// Failure of a pipeline stage, recorded on its `StageResult`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Stage {stage} timed out after {after:?}")]
    Timeout { stage: String, after: Duration },

    #[error("Stage {stage} dependency {dependency} finished {status}")]
    DependencyFailed {
        stage: String,
        dependency: String,
        status: String,
    },

    #[error("Stage {0} cancelled")]
    Cancelled(String),

    #[error("Stage {stage} failed: {message}")]
    Work { stage: String, message: String },
}

/// Invalid stage graph. Detected before any stage runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerConfigError {
    #[error("No stages declared")]
    Empty,

    #[error("Stage {0} declared more than once")]
    DuplicateStage(String),

    #[error("Stage {stage} depends on undeclared stage {dependency}")]
    UndeclaredDependency { stage: String, dependency: String },

    #[error("Stage {stage} fans out over {source_stage}, which is not one of its dependencies")]
    InvalidFanOutSource { stage: String, source_stage: String },

    #[error("Dependency cycle through stage {0}")]
    Cycle(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
