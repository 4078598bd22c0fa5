//! Retry policy for the `send` operation.
//!
//! Attempts are 1-indexed. After failed attempt `n` the client sleeps
//! `base * 2^(n - 1)` before attempt `n + 1`; with the default 1s base that
//! is 1s, then 2s, and the third failure is final.

use std::time::Duration;

use crate::config::DeliveryConfig;

/// Exponent cap so the shift never overflows.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
        }
    }

    #[must_use]
    pub const fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay to wait after `attempt` failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.backoff_base)
    }
}

/// `base * 2^(attempt - 1)`, saturating.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
    base.saturating_mul(1u32 << exponent)
}
