pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;

pub use circuit_breaker::{Admission, BreakerPermit, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use rate_limiter::RateLimiter;
pub use registry::{BackendRegistry, BackendSnapshot, BackendState};
