//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::env_parse;

pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

/// Delay schedule between agent reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of each delay randomized in both directions, `0.0..=1.0`.
    pub jitter: f64,
    attempt: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        )
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_BACKOFF_JITTER,
            attempt: 0,
        }
    }

    /// - `TUNNEL_BACKOFF_INITIAL_MS`: default 1000
    /// - `TUNNEL_BACKOFF_MAX_MS`: default 30000
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            Duration::from_millis(env_parse("TUNNEL_BACKOFF_INITIAL_MS", DEFAULT_BACKOFF_INITIAL_MS)),
            Duration::from_millis(env_parse("TUNNEL_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)),
        )
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = clamp_jitter(jitter);
        self
    }

    /// Consecutive delays handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt, capped at `max`.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempt.min(64)).unwrap_or(64);
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        let jitter = clamp_jitter(self.jitter);
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::rng().random_range(-jitter..=jitter);
        base.mul_f64(1.0 + spread).min(self.max)
    }

    /// Start over from `initial`, after a session that came up.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Non-finite jitter disables it.
fn clamp_jitter(jitter: f64) -> f64 {
    if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
