//! Failure containment for remote execution plus checkpoint/resume.
//!
//! Each remote endpoint gets a [`CircuitBreaker`] and a [`RateLimiter`],
//! configured together through a [`ResiliencePolicy`] (named presets or the
//! fluent builder). The [`checkpoint`] module persists build progress so an
//! interrupted session can resume.

pub mod breaker;
pub mod checkpoint;
pub mod limiter;
mod policy;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use checkpoint::{Checkpoint, CheckpointManager, ResumePlan};
pub use limiter::{LimiterConfig, Priority, RateLimiter};
pub use policy::{ResiliencePolicy, ResiliencePolicyBuilder, RetryConfig};

/// Breaker + limiter pair guarding one endpoint.
#[derive(Debug)]
pub struct EndpointGuard {
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    policy: ResiliencePolicy,
}

impl EndpointGuard {
    pub fn new(endpoint: impl Into<String> + Clone, policy: ResiliencePolicy) -> Self {
        Self {
            breaker: CircuitBreaker::new(endpoint.clone(), policy.breaker),
            limiter: RateLimiter::new(endpoint, policy.limiter),
            policy,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.policy.retry
    }

    /// Gate one call: breaker first, then a token.
    pub fn admit(&self, priority: Priority) -> crate::error::Result<()> {
        self.breaker.try_acquire()?;
        self.limiter.try_acquire(priority)
    }

    /// Records an outcome and adapts the limiter to the breaker's health.
    pub fn observe(&self, success: bool) {
        if success {
            self.breaker.on_success();
        } else {
            self.breaker.on_failure();
        }
        let factor = 1.0 - self.breaker.failure_rate() * 0.9;
        self.limiter.adapt(factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_gates_and_adapts() {
        let guard = EndpointGuard::new("worker-1", ResiliencePolicy::standard());
        assert!(guard.admit(Priority::Normal).is_ok());
        guard.observe(true);
        guard.observe(false);
        // degradation slows the limiter but does not close the gate yet
        assert!(guard.limiter().available() > 0.0);
        assert_eq!(guard.breaker().state(), BreakerState::Closed);
    }
}
