use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for the dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Requests accepted, including those terminal at intake
    pub accepted: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
    /// Accepted with no jobs (no recipients, render failure)
    pub intake_failed: AtomicU64,
    pub jobs_created: AtomicU64,
    pub attempts: AtomicU64,
    pub succeeded: AtomicU64,
    pub transient_failures: AtomicU64,
    pub permanent_failures: AtomicU64,
    /// Outcomes that lost their compare-and-swap (withdrawn meanwhile)
    pub discarded: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub cancelled: AtomicU64,
}

impl DispatcherStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            intake_failed: self.intake_failed.load(Ordering::Relaxed),
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub intake_failed: u64,
    pub jobs_created: u64,
    pub attempts: u64,
    pub succeeded: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub discarded: u64,
    pub retries_scheduled: u64,
    pub cancelled: u64,
}

/// Result of a recovery or reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Pending or InFlight jobs put back on the work queue
    pub requeued: usize,
    /// TransientFailed jobs handed back to the retry scheduler
    pub rescheduled: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued + self.rescheduled
    }
}

/// What the dispatch loop did with in-flight attempts when it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    /// Attempts still running at the drain deadline; recovered on next start
    pub abandoned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = DispatcherStats::default();
        DispatcherStats::incr(&stats.accepted);
        DispatcherStats::incr(&stats.accepted);
        DispatcherStats::incr(&stats.discarded);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.discarded, 1);
        assert_eq!(snapshot.succeeded, 0);
    }

    #[test]
    fn test_recovery_report_total() {
        let report = RecoveryReport {
            requeued: 3,
            rescheduled: 2,
        };
        assert_eq!(report.total(), 5);
    }
}
