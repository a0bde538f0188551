//! Retry policy for failed processing: capped exponential backoff.
//!
//! attempt n (1-based) that fails waits `min(cap, base * 2^(n-1))`,
//! minus up to `jitter` of that delay, before the row is claimable again.
//! Once `max_attempts` is reached the run is marked failed for good.

use crate::config::{bounded_millis, RetryConfig, MAX_DURATION_MS};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_ms: u64,
    cap_ms: u64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_ms: config.backoff_base_ms.min(MAX_DURATION_MS),
            cap_ms: config.backoff_cap_ms.max(config.backoff_base_ms).min(MAX_DURATION_MS),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay after `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self.base_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
        bounded_millis(delay)
    }

    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self.backoff(attempt);
        let jittered = if self.jitter > 0.0 {
            let cut = rng.gen_range(0.0..=self.jitter);
            let ms = delay.num_milliseconds() as f64 * (1.0 - cut);
            Duration::milliseconds(ms.round() as i64)
        } else {
            delay
        };
        RetryDecision::RetryAt(now + jittered)
    }
}
