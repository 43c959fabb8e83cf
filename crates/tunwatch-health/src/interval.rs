//! Check interval classification.
//!
//! Buckets the time since the last completed check into a
//! [`CheckInterval`]. Only `Now` lets a non-forced request probe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tunwatch_state::CheckInterval;

/// Boundaries between the interval buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalThresholds {
    /// Checks younger than this are `FirstInterval`.
    pub first: Duration,
    /// Checks at least this old are `Now` (due).
    pub due: Duration,
}

impl Default for IntervalThresholds {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(20),
            due: Duration::from_secs(60),
        }
    }
}

impl IntervalThresholds {
    /// `first` must not exceed `due`.
    pub fn is_valid(&self) -> bool {
        self.first <= self.due
    }

    pub fn classify(&self, elapsed: Duration) -> CheckInterval {
        if elapsed < self.first {
            CheckInterval::FirstInterval
        } else if elapsed >= self.due {
            CheckInterval::Now
        } else {
            CheckInterval::SecondInterval
        }
    }
}

/// Classify with the default 20s / 60s thresholds.
pub fn classify_interval(elapsed: Duration) -> CheckInterval {
    IntervalThresholds::default().classify(elapsed)
}

/// Time between `last_ms` and `now_ms`. A clock behind the stored
/// timestamp counts as no time elapsed.
pub fn elapsed_since(now_ms: u64, last_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(last_ms))
}

/// Source of epoch-millisecond wall-clock time.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually driven clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
