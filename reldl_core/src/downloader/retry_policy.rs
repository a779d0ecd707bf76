use std::time::Duration;

use rand::Rng;

use crate::config::DownloadOptions;
use crate::types::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_options(options: &DownloadOptions) -> Self {
        Self::new(
            options.max_attempts,
            options.base_retry_delay(),
            options.max_retry_delay(),
            options.retry_jitter,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempts` is the number of attempts already made, the failed one included.
    pub fn should_retry(&self, attempts: u32, kind: ErrorKind) -> RetryDecision {
        if kind == ErrorKind::Permanent || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.jittered(self.backoff(attempts)))
    }

    /// `base * 2^(attempts-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Shaves a random share of up to `jitter` off the delay.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 - cut)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&DownloadOptions::default())
    }
}
