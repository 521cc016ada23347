//! Token-bucket rate limiting with priority lanes.
//!
//! The bucket refills continuously at `rate` tokens per second up to `burst`.
//! High-priority calls may drain the bucket completely; normal and low lanes
//! keep a growing reserve untouched so urgent work still gets through under
//! load. An adaptive factor scales the effective rate down as the associated
//! circuit breaker degrades.

use crate::error::{BuildError, Result};
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Lane of a rate-limited call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Fraction of the burst capacity this lane must leave in reserve.
    fn reserve(self) -> f64 {
        match self {
            Priority::High => 0.0,
            Priority::Normal => 0.1,
            Priority::Low => 0.3,
        }
    }
}

/// Limiter tuning, usually taken from a [`ResiliencePolicy`] preset.
///
/// [`ResiliencePolicy`]: crate::resilience::ResiliencePolicy
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimiterConfig {
    /// Steady-state tokens per second.
    pub rate: f64,
    /// Bucket capacity (burst size).
    pub burst: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self { rate: 10.0, burst: 20.0 }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    /// Multiplier in `(0, 1]` applied to the refill rate.
    adaptive: f64,
}

#[derive(Debug)]
pub struct RateLimiter {
    endpoint: String,
    config: LimiterConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(endpoint: impl Into<String>, config: LimiterConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            bucket: Mutex::new(Bucket {
                tokens: config.burst,
                last_refill: Instant::now(),
                adaptive: 1.0,
            }),
        }
    }

    /// Takes one token from the lane, failing with
    /// [`BuildError::RateLimited`] when the lane is exhausted.
    pub fn try_acquire(&self, priority: Priority) -> Result<()> {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        let floor = self.config.burst * priority.reserve();
        if bucket.tokens - 1.0 >= floor || (priority == Priority::High && bucket.tokens >= 1.0) {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(BuildError::RateLimited(self.endpoint.clone()))
        }
    }

    /// Blocks until a token is available or `deadline` passes.
    pub fn acquire_within(&self, priority: Priority, deadline: Duration) -> Result<()> {
        let give_up = Instant::now() + deadline;
        loop {
            match self.try_acquire(priority) {
                Ok(()) => return Ok(()),
                Err(err) if Instant::now() >= give_up => return Err(err),
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
    }

    /// Scales the refill rate; `factor` is clamped to `[0.05, 1]`. Driven by
    /// the circuit breaker as an endpoint degrades.
    pub fn adapt(&self, factor: f64) {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        bucket.adaptive = factor.clamp(0.05, 1.0);
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.rate * bucket.adaptive).min(self.config.burst);
    }
}
