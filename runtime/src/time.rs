//! Wall-clock sources.

use driftsync_engine::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Millisecond wall clock handed to the engine core.
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now_ms(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTime {
    now: AtomicU64,
}

impl ManualTime {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) -> Timestamp {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_time_moves_on_request() {
        let time = ManualTime::new(1000);
        assert_eq!(time.now_ms(), 1000);
        assert_eq!(time.advance(250), 1250);
        time.set(5);
        assert_eq!(time.now_ms(), 5);
    }

    #[test]
    fn system_time_is_after_2024() {
        assert!(SystemTime.now_ms() > 1_704_067_200_000);
    }
}
