//! Logical clock for `last_change` stamps.
//!
//! Timestamps are microseconds since the Unix epoch, forced monotonic per
//! writer: `next = max(now_us, last + 1)`. Observing a foreign timestamp
//! (for example the tip of one's own branch written by another process)
//! advances `last`, so a fresh stamp always orders after everything this
//! writer has seen.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Where the clock reads "now" from.
#[derive(Debug, Clone)]
enum TimeSource {
    System,
    Manual(Arc<AtomicU64>),
}

/// Handle that drives a manual clock.
#[derive(Debug, Clone)]
pub struct ManualTime(Arc<AtomicU64>);

impl ManualTime {
    pub fn set(&self, micros: u64) {
        self.0.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, micros: u64) {
        self.0.fetch_add(micros, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct LogicalClock {
    source: TimeSource,
    last: Mutex<u64>,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::system()
    }
}

impl LogicalClock {
    #[must_use]
    pub const fn system() -> Self {
        Self {
            source: TimeSource::System,
            last: Mutex::new(0),
        }
    }

    /// A clock whose "now" is set explicitly. Used by tests and replays.
    #[must_use]
    pub fn manual(start: u64) -> (Self, ManualTime) {
        let now = Arc::new(AtomicU64::new(start));
        let clock = Self {
            source: TimeSource::Manual(Arc::clone(&now)),
            last: Mutex::new(0),
        };
        (clock, ManualTime(now))
    }

    fn now(&self) -> u64 {
        match &self.source {
            TimeSource::System => system_time_us(),
            TimeSource::Manual(now) => now.load(Ordering::SeqCst),
        }
    }

    /// Next monotonic timestamp.
    pub fn tick(&self) -> u64 {
        let mut last = self.last.lock();
        let next = self.now().max(last.saturating_add(1));
        *last = next;
        next
    }

    /// Record a timestamp seen elsewhere so later ticks order after it.
    pub fn observe(&self, timestamp: u64) {
        let mut last = self.last.lock();
        *last = (*last).max(timestamp);
    }

    #[must_use]
    pub fn last(&self) -> u64 {
        *self.last.lock()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn system_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
