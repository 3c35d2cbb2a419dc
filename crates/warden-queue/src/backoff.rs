//! Retry backoff policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest shift applied to `min`; anything beyond is clamped to `max` anyway.
const MAX_DOUBLINGS: u32 = 30;

/// Exponential backoff bounded by `[min, max]`.
///
/// The wait for the `n`-th retry of a row is `min * 2^(n-1)`, clamped to
/// `max`. Attempt `0` is treated like the first retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exponential {
    pub min: Duration,
    pub max: Duration,
}

impl Exponential {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Wait before the `error_count`-th retry becomes eligible.
    pub fn delay(&self, error_count: u32) -> Duration {
        let doublings = error_count.saturating_sub(1).min(MAX_DOUBLINGS);
        let wait = self
            .min
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.max);

        wait.clamp(self.min, self.max.max(self.min))
    }
}

impl Default for Exponential {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(60 * 60),
        }
    }
}
