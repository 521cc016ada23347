//! Named resilience presets and the fluent policy builder.

use super::{breaker::BreakerConfig, limiter::LimiterConfig};
use std::time::Duration;

/// Retry behavior for transient remote failures.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_backoff: Duration,
    /// Backoff multiplier per attempt.
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_backoff: Duration::from_millis(200), factor: 2.0 }
    }
}

impl RetryConfig {
    /// Backoff before the given (1-based) retry attempt.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = self.factor.powi(attempt.saturating_sub(1) as i32);
        self.base_backoff.mul_f64(factor)
    }
}

/// An immutable bundle of breaker, limiter and retry settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResiliencePolicy {
    pub breaker: BreakerConfig,
    pub limiter: LimiterConfig,
    pub retry: RetryConfig,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl ResiliencePolicy {
    pub fn builder() -> ResiliencePolicyBuilder {
        ResiliencePolicyBuilder::default()
    }

    /// For work that must not be dropped: trips late, retries hard.
    pub fn critical() -> Self {
        Self::builder()
            .failure_threshold(0.8)
            .min_samples(10)
            .cooldown(Duration::from_secs(5))
            .rate(50.0)
            .burst(100.0)
            .max_retries(6)
            .build()
    }

    /// Balanced defaults.
    pub fn standard() -> Self {
        Self::builder().build()
    }

    /// For flaky transports: trips early, probes patiently.
    pub fn network() -> Self {
        Self::builder()
            .failure_threshold(0.3)
            .min_samples(5)
            .window(Duration::from_secs(20))
            .cooldown(Duration::from_secs(15))
            .rate(20.0)
            .burst(40.0)
            .max_retries(5)
            .build()
    }

    /// For fan-out heavy workloads: generous token budget.
    pub fn high_throughput() -> Self {
        Self::builder()
            .failure_threshold(0.6)
            .min_samples(20)
            .rate(200.0)
            .burst(400.0)
            .max_retries(2)
            .build()
    }

    /// Mostly permissive, for local or trusted endpoints.
    pub fn relaxed() -> Self {
        Self::builder()
            .failure_threshold(0.95)
            .min_samples(50)
            .rate(1000.0)
            .burst(1000.0)
            .max_retries(1)
            .build()
    }
}

/// Accumulates options and produces an immutable [`ResiliencePolicy`].
#[derive(Clone, Debug, Default)]
pub struct ResiliencePolicyBuilder {
    breaker: BreakerConfig,
    limiter: LimiterConfig,
    retry: RetryConfig,
}

impl ResiliencePolicyBuilder {
    pub fn failure_threshold(mut self, threshold: f64) -> Self {
        self.breaker.failure_threshold = threshold;
        self
    }

    pub fn min_samples(mut self, samples: usize) -> Self {
        self.breaker.min_samples = samples;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.breaker.window = window;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.breaker.cooldown = cooldown;
        self
    }

    pub fn probes_to_close(mut self, probes: usize) -> Self {
        self.breaker.probes_to_close = probes;
        self
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.limiter.rate = rate;
        self
    }

    pub fn burst(mut self, burst: f64) -> Self {
        self.limiter.burst = burst;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.retry.base_backoff = backoff;
        self
    }

    pub fn build(self) -> ResiliencePolicy {
        ResiliencePolicy { breaker: self.breaker, limiter: self.limiter, retry: self.retry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ_meaningfully() {
        assert!(
            ResiliencePolicy::network().breaker.failure_threshold
                < ResiliencePolicy::critical().breaker.failure_threshold
        );
        assert!(
            ResiliencePolicy::high_throughput().limiter.rate
                > ResiliencePolicy::standard().limiter.rate
        );
    }

    #[test]
    fn builder_overrides_single_fields() {
        let policy = ResiliencePolicy::builder()
            .failure_threshold(0.42)
            .burst(7.0)
            .build();
        assert_eq!(policy.breaker.failure_threshold, 0.42);
        assert_eq!(policy.limiter.burst, 7.0);
        // untouched fields keep their defaults
        assert_eq!(policy.retry.max_retries, RetryConfig::default().max_retries);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
    }
}
