//! Circuit breaker for remote endpoints.
//!
//! One breaker guards one endpoint. The rolling failure window drives the
//! `Closed → Open → HalfOpen` state machine: the circuit opens when the
//! failure rate over the window reaches the threshold (with a minimum sample
//! count), rejects calls while open, and lets a bounded number of probes
//! through after the cooldown.

use crate::error::{BuildError, Result};
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning, usually taken from a [`ResiliencePolicy`] preset.
///
/// [`ResiliencePolicy`]: crate::resilience::ResiliencePolicy
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BreakerConfig {
    /// Failure rate in `[0, 1]` that opens the circuit.
    pub failure_threshold: f64,
    /// Samples required before the rate is meaningful.
    pub min_samples: usize,
    /// Rolling window the rate is computed over.
    pub window: Duration,
    /// Time the circuit stays open before probing.
    pub cooldown: Duration,
    /// Successful probes required to close again.
    pub probes_to_close: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_samples: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(10),
            probes_to_close: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// (when, failed) samples within the window.
    samples: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    /// Successful probes seen while half-open.
    probe_successes: usize,
    /// Probes currently allowed out.
    probes_in_flight: usize,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                samples: VecDeque::new(),
                opened_at: None,
                probe_successes: 0,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        inner.state
    }

    /// Current failure rate over the rolling window.
    pub fn failure_rate(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        let total = inner.samples.len();
        if total == 0 {
            return 0.0;
        }
        let failed = inner.samples.iter().filter(|(_, failed)| *failed).count();
        failed as f64 / total as f64
    }

    /// Asks permission for one call. While half-open only
    /// `probes_to_close` calls may be in flight.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(BuildError::CircuitOpen(self.endpoint.clone())),
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.probes_to_close {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(BuildError::CircuitOpen(self.endpoint.clone()))
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        inner.samples.push_back((Instant::now(), false));
        if inner.state == BreakerState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            inner.probe_successes += 1;
            if inner.probe_successes >= self.config.probes_to_close {
                debug!(endpoint = %self.endpoint, "circuit closed");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
                inner.samples.clear();
            }
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.refresh(&mut inner);
        inner.samples.push_back((Instant::now(), true));
        match inner.state {
            BreakerState::HalfOpen => {
                // a failed probe re-opens immediately
                self.open(&mut inner);
            }
            BreakerState::Closed => {
                let total = inner.samples.len();
                if total >= self.config.min_samples {
                    let failed = inner.samples.iter().filter(|(_, failed)| *failed).count();
                    if failed as f64 / total as f64 >= self.config.failure_threshold {
                        self.open(&mut inner);
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        warn!(endpoint = %self.endpoint, "circuit opened");
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_successes = 0;
        inner.probes_in_flight = 0;
    }

    /// Expires samples outside the window and moves `Open → HalfOpen` after
    /// the cooldown.
    fn refresh(&self, inner: &mut BreakerInner) {
        let now = Instant::now();
        while let Some((when, _)) = inner.samples.front() {
            if now.duration_since(*when) > self.config.window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if now.duration_since(opened_at) >= self.config.cooldown {
                    debug!(endpoint = %self.endpoint, "circuit half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_successes = 0;
                    inner.probes_in_flight = 0;
                }
            }
        }
    }
}
