//! Push pacing from backend-advertised rate limits.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remaining-quota headers reported with a push response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the quota resets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_after_ms: Option<u64>,
}

impl RateLimit {
    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        f64::from(self.remaining) / f64::from(self.limit)
    }
}

const MAX_SLOWDOWN: f64 = 16.0;

/// Slows pushes down when the remaining quota drops below a threshold.
///
/// Below the threshold, waits grow and batches shrink by the factor
/// `threshold / ratio`, capped at 16x.
#[derive(Debug)]
pub struct RateGovernor {
    threshold: f64,
    last: Mutex<Option<RateLimit>>,
}

impl RateGovernor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            last: Mutex::new(None),
        }
    }

    /// Record the latest quota report (or its absence).
    pub fn observe(&self, limit: Option<RateLimit>) {
        let Some(limit) = limit else {
            return;
        };
        let before = self.slowdown();
        *self.last.lock() = Some(limit);
        let after = self.slowdown();
        if after > 1.0 && before <= 1.0 {
            tracing::warn!(
                remaining = limit.remaining,
                limit = limit.limit,
                slowdown = after,
                "Rate limit quota low, slowing pushes"
            );
        } else if after <= 1.0 && before > 1.0 {
            tracing::info!("Rate limit quota recovered");
        }
    }

    /// Current slowdown factor (1.0 means full speed).
    pub fn slowdown(&self) -> f64 {
        match *self.last.lock() {
            Some(limit) if limit.ratio() < self.threshold => {
                (self.threshold / limit.ratio().max(1.0 / MAX_SLOWDOWN)).min(MAX_SLOWDOWN)
            }
            _ => 1.0,
        }
    }

    /// Batch size to use given the configured maximum.
    pub fn batch_size(&self, max_batch: usize) -> usize {
        ((max_batch.max(1) as f64 / self.slowdown()).round() as usize).max(1)
    }

    /// Stretch a wait by the current slowdown.
    pub fn pace(&self, wait: Duration) -> Duration {
        wait.mul_f64(self.slowdown())
    }

    /// Extra pause before the next send when the quota is exhausted.
    pub fn hold(&self) -> Option<Duration> {
        match *self.last.lock() {
            Some(limit) if limit.remaining == 0 => limit.reset_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }
}
