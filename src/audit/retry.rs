// Exponential backoff for audit writes
//
// - Exponential backoff from `base_delay_ms`, capped at `max_delay_ms`
// - Bounded number of retries
// - ±20% jitter so a recovering sink is not hit in lockstep

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Retry policy for failed audit writes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Upper bound on a single delay in milliseconds
    pub max_delay_ms: u64,
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_retries: 5,
            max_delay_ms: 5_000,
            use_jitter: true,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Policy without retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Decision after failed retry number `attempt` (0 = the initial write)
    ///
    /// delay = min(base * 2^attempt, max) ± 20%
    pub fn next(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_retries {
            debug!(max_retries = self.max_retries, "Audit retries exhausted");
            return RetryDecision::GiveUp;
        }

        let delay_ms = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_delay_ms);

        let delay_ms = if self.use_jitter && delay_ms > 0 {
            let jitter = delay_ms as f64 * 0.2;
            let offset = (rand::random::<f64>() - 0.5) * 2.0 * jitter;
            (delay_ms as f64 + offset).max(0.0) as u64
        } else {
            delay_ms
        };

        RetryDecision::Retry(Duration::from_millis(delay_ms))
    }

    /// Longest time the policy keeps an entry alive: the sum of all
    /// un-jittered delays, and never less than one base delay
    pub fn deadline(&self) -> Duration {
        let total: u64 = (0..self.max_retries)
            .map(|attempt| {
                self.base_delay_ms
                    .saturating_mul(2_u64.saturating_pow(attempt))
                    .min(self.max_delay_ms)
            })
            .fold(0, u64::saturating_add);
        Duration::from_millis(total.max(self.base_delay_ms))
    }
}
