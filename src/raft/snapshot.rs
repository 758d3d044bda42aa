//! Snapshot timing, including the delayed-snapshot mode
//!
//! Without a delay a snapshot is taken as soon as the uncompacted log
//! reaches the trigger. With a delay the snapshot is deferred until the
//! delay elapses or the log grows past the force threshold.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Uncompacted entries that trigger a snapshot
    pub trigger_log_num: u64,
    /// Maximum deferral once triggered; `None` snapshots immediately
    pub delay: Option<Duration>,
    /// Uncompacted entries that force a deferred snapshot
    pub force_log_num: u64,
}

#[derive(Debug)]
pub struct SnapshotScheduler {
    policy: SnapshotPolicy,
    triggered_at: Option<Instant>,
}

impl SnapshotScheduler {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self {
            policy,
            triggered_at: None,
        }
    }

    /// Whether a snapshot should be taken now
    pub fn should_snapshot(&mut self, uncompacted: u64, now: Instant) -> bool {
        if self.policy.trigger_log_num == 0 || uncompacted < self.policy.trigger_log_num {
            self.triggered_at = None;
            return false;
        }
        let Some(delay) = self.policy.delay else {
            return true;
        };
        let triggered_at = *self.triggered_at.get_or_insert(now);
        now.duration_since(triggered_at) >= delay || uncompacted >= self.policy.force_log_num
    }

    /// Deadline of the pending deferred snapshot, if any
    pub fn deferred_until(&self) -> Option<Instant> {
        match (self.triggered_at, self.policy.delay) {
            (Some(at), Some(delay)) => Some(at + delay),
            _ => None,
        }
    }

    pub fn snapshot_taken(&mut self) {
        self.triggered_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(delay: Option<Duration>) -> SnapshotPolicy {
        SnapshotPolicy {
            trigger_log_num: 10,
            delay,
            force_log_num: 100,
        }
    }

    #[test]
    fn test_immediate_snapshot_without_delay() {
        let mut scheduler = SnapshotScheduler::new(policy(None));
        let now = Instant::now();
        assert!(!scheduler.should_snapshot(9, now));
        assert!(scheduler.should_snapshot(10, now));
    }

    #[test]
    fn test_delay_defers_until_elapsed() {
        let mut scheduler = SnapshotScheduler::new(policy(Some(Duration::from_secs(3600))));
        let start = Instant::now();

        assert!(!scheduler.should_snapshot(10, start));
        assert_eq!(
            scheduler.deferred_until(),
            Some(start + Duration::from_secs(3600))
        );
        assert!(!scheduler.should_snapshot(50, start + Duration::from_secs(1800)));
        assert!(scheduler.should_snapshot(50, start + Duration::from_secs(3600)));

        scheduler.snapshot_taken();
        assert!(scheduler.deferred_until().is_none());
    }

    #[test]
    fn test_log_growth_forces_deferred_snapshot() {
        let mut scheduler = SnapshotScheduler::new(policy(Some(Duration::from_secs(3600))));
        let start = Instant::now();
        assert!(!scheduler.should_snapshot(10, start));
        assert!(scheduler.should_snapshot(100, start + Duration::from_secs(1)));
    }

    #[test]
    fn test_trigger_resets_after_compaction() {
        let mut scheduler = SnapshotScheduler::new(policy(Some(Duration::from_secs(60))));
        let start = Instant::now();
        assert!(!scheduler.should_snapshot(10, start));
        // Log compacted by someone else: pending deferral is dropped
        assert!(!scheduler.should_snapshot(0, start));
        assert!(scheduler.deferred_until().is_none());
    }
}
