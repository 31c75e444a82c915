//! Reconnect backoff: exponential, capped, with proportional jitter.
//!
//! Delay for attempt `n` is `base * 2^n`, clamped to `max`, then reduced by a
//! random fraction of up to `jitter` so a fleet of clients dropped by the same
//! outage does not reconnect in lockstep. Jitter only ever shortens the
//! delay, so `max` stays a hard ceiling.

use std::time::Duration;

use crate::config::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self { base, max, jitter }
    }

    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.jitter)
    }

    /// Delay before reconnect attempt `attempt` (0-based), with random jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 { rand::random::<f64>() } else { 0.0 };
        self.delay_with_sample(attempt, sample)
    }

    /// Deterministic core of [`Backoff::delay`]; `sample` is in `[0, 1)`.
    #[must_use]
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self.base.saturating_mul(factor).min(self.max);
        let sample = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.0 };
        let shave = self.jitter * sample;
        capped.mul_f64(1.0 - shave)
    }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
