//! Monotonic wall clock for "now"-relative reads
//!
//! Last-value queries read "the most recent value at or before now". Using a
//! clock that never goes backward keeps two consecutive last queries from
//! observing time travel after an NTP step.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Millisecond clock that never returns a smaller value than before
#[derive(Debug, Default)]
pub struct MonotonicClock {
    /// Largest timestamp handed out so far (millis)
    high_water_ms: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch milliseconds, clamped to the previous high-water mark
    ///
    /// Unlike a strictly increasing sequence, equal values are allowed: two
    /// reads within the same millisecond see the same "now".
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }

    /// Current time as a `DateTime<Utc>`
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_default()
    }
}
