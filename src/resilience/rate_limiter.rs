//! Per-backend token bucket.
//!
//! Backed by `governor`'s GCRA limiter, which is equivalent to a token
//! bucket holding at most `capacity` tokens and regaining one every
//! `1 / refill_per_second` seconds. Acquisition is a single atomic
//! compare-and-swap, so it never blocks and never over-admits under
//! concurrent callers.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Gcra};

use crate::config::RateLimitConfig;
use crate::error::{AppError, Result};

pub struct RateLimiter {
    limiter: Gcra<NotKeyed, InMemoryState, DefaultClock>,
    config: RateLimitConfig,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let capacity = NonZeroU32::new(config.capacity).ok_or_else(|| {
            AppError::Config("rate limit capacity must be at least 1".to_string())
        })?;

        if !(config.refill_per_second > 0.0) || !config.refill_per_second.is_finite() {
            return Err(AppError::Config(format!(
                "rate limit refill must be a positive rate, got {}",
                config.refill_per_second
            )));
        }

        let period = Duration::try_from_secs_f64(1.0 / config.refill_per_second).map_err(|_| {
            AppError::Config(format!(
                "rate limit refill {} is too slow to represent",
                config.refill_per_second
            ))
        })?;
        let quota = Quota::with_period(period)
            .ok_or_else(|| AppError::Config("rate limit refill period is zero".to_string()))?
            .allow_burst(capacity);

        Ok(Self {
            limiter: Gcra::direct(quota),
            config,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Take one token if available. Returns immediately.
    pub fn try_acquire(&self) -> bool {
        match self.limiter.check() {
            Ok(()) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
