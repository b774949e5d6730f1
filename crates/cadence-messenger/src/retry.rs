//! Retry policies for failed message handling.
//!
//! The policy only decides how many attempts a message gets and how long to
//! wait before the next one. The worker keeps redelivery times
//! non-decreasing on top of whatever the policy returns.

use std::time::Duration;

use rand::Rng;

/// Pluggable retry policy.
pub trait RetryStrategy: Send + Sync {
    /// Total handling attempts a message gets, including the first one.
    fn max_attempts(&self) -> u32;

    /// Whether a message that has failed `attempts` times gets another try.
    fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts()
    }

    /// Delay before the next attempt after `attempts` failures.
    fn delay_for(&self, attempts: u32) -> Duration;
}

/// Exponential backoff: `delay * multiplier^(attempts - 1)`, optionally
/// capped and randomized by a jitter fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplierRetryStrategy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub delay: Duration,
    /// Growth factor per attempt (at least 1.0).
    pub multiplier: f64,
    /// Upper bound on the delay; zero means uncapped.
    pub max_delay: Duration,
    /// Random spread as a fraction of the delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for MultiplierRetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::ZERO,
            jitter: 0.1,
        }
    }
}

impl MultiplierRetryStrategy {
    /// Create a strategy without jitter or cap.
    pub fn new(max_attempts: u32, delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            delay,
            multiplier: multiplier.max(1.0),
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Cap the delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Randomize delays by up to `jitter` of their value in either direction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn base_delay_ms(&self, attempts: u32) -> f64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.delay.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent)
    }
}

impl RetryStrategy for MultiplierRetryStrategy {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let mut delay_ms = self.base_delay_ms(attempts);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-jitter..=jitter);
            delay_ms += delay_ms * spread;
        }

        if !self.max_delay.is_zero() {
            delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        }

        if !delay_ms.is_finite() {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}
