//! Token-bucket rate limiter for consumers.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Allows `limit` messages per `interval`, refilling continuously.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: u32,
    interval: Duration,
    tokens: f64,
    last_refill: Option<DateTime<Utc>>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(limit: u32, interval: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            interval,
            tokens: f64::from(limit),
            last_refill: None,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_refill {
            // A clock step backwards refills nothing
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            let rate = self.tokens_per_sec();
            if rate.is_finite() {
                self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(f64::from(self.limit));
            } else {
                self.tokens = f64::from(self.limit);
            }
        }
        if self.last_refill.is_none_or(|last| now > last) {
            self.last_refill = Some(now);
        }
    }

    fn tokens_per_sec(&self) -> f64 {
        f64::from(self.limit) / self.interval.as_secs_f64()
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - self.tokens;
        let wait = Duration::from_secs_f64(missing / self.tokens_per_sec());
        // Never report zero, the caller would spin
        Err(wait.max(Duration::from_millis(1)))
    }
}
