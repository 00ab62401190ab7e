use registry_sync_store_sqlite::AuditCounters;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditPoll {
    pub has_new_data_added: bool,
    pub has_new_data_deleted: bool,
    pub has_new_data_changed: bool,
}

/// Remembers the highest audit counters seen so far and reports which grew.
///
/// High-water marks never decrease, so a counter that shrinks (for example
/// after a restore from backup) reports nothing new until it passes the mark.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditPoller {
    high_water: AuditCounters,
}

impl AuditPoller {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn high_water(&self) -> AuditCounters {
        self.high_water
    }

    pub fn observe(&mut self, current: AuditCounters) -> AuditPoll {
        let poll = AuditPoll {
            has_new_data_added: current.added_logs > self.high_water.added_logs,
            has_new_data_deleted: current.deleted_logs > self.high_water.deleted_logs,
            has_new_data_changed: current.change_logs > self.high_water.change_logs,
        };

        self.high_water = AuditCounters {
            added_logs: current.added_logs.max(self.high_water.added_logs),
            deleted_logs: current.deleted_logs.max(self.high_water.deleted_logs),
            change_logs: current.change_logs.max(self.high_water.change_logs),
        };
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(added_logs: i64, deleted_logs: i64, change_logs: i64) -> AuditCounters {
        AuditCounters { added_logs, deleted_logs, change_logs }
    }

    // Test IDs: TPOL-001
    #[test]
    fn reports_growth_once_per_increase() {
        let mut poller = AuditPoller::new();

        let first = poller.observe(counters(3, 0, 1));
        assert!(first.has_new_data_added);
        assert!(!first.has_new_data_deleted);
        assert!(first.has_new_data_changed);

        let second = poller.observe(counters(3, 0, 1));
        assert_eq!(
            second,
            AuditPoll {
                has_new_data_added: false,
                has_new_data_deleted: false,
                has_new_data_changed: false
            }
        );

        assert!(poller.observe(counters(3, 1, 1)).has_new_data_deleted);
    }

    // Test IDs: TPOL-002
    #[test]
    fn high_water_marks_are_monotonic() {
        let mut poller = AuditPoller::new();
        poller.observe(counters(5, 2, 4));

        let shrunk = poller.observe(counters(1, 1, 1));
        assert!(!shrunk.has_new_data_added);
        assert_eq!(poller.high_water(), counters(5, 2, 4));

        assert!(!poller.observe(counters(5, 2, 4)).has_new_data_added);
        assert!(poller.observe(counters(6, 2, 4)).has_new_data_added);
    }
}
