//! Store metrics
//!
//! Relaxed atomic counters for dispatch, autorun, and fault activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the store and its notifier
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Actions accepted by `dispatch`
    pub actions_dispatched: AtomicU64,

    /// Commits that changed at least one slice
    pub commits: AtomicU64,

    /// Dispatches that left the tree untouched
    pub noop_commits: AtomicU64,

    /// Dispatches rejected with a reducer fault
    pub reducer_faults: AtomicU64,

    /// Selector evaluations performed by the autorun engine
    pub autorun_evals: AtomicU64,

    /// Callbacks actually fired
    pub autorun_fires: AtomicU64,

    /// Evaluations skipped by memoization
    pub autorun_skips: AtomicU64,

    /// Faults contained to a single subscription
    pub subscription_faults: AtomicU64,

    /// Events handed to at least one handler
    pub events_delivered: AtomicU64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&self) {
        self.actions_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_noop(&self) {
        self.noop_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reducer_fault(&self) {
        self.reducer_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_autorun_eval(&self) {
        self.autorun_evals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_autorun_fire(&self) {
        self.autorun_fires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_autorun_skip(&self) {
        self.autorun_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_fault(&self) {
        self.subscription_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of evaluations short-circuited by memoization
    pub fn skip_rate(&self) -> f64 {
        let skips = self.autorun_skips.load(Ordering::Relaxed) as f64;
        let evals = self.autorun_evals.load(Ordering::Relaxed) as f64;
        if evals == 0.0 {
            0.0
        } else {
            skips / evals
        }
    }

    /// Plain-value copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            actions_dispatched: self.actions_dispatched.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            noop_commits: self.noop_commits.load(Ordering::Relaxed),
            reducer_faults: self.reducer_faults.load(Ordering::Relaxed),
            autorun_evals: self.autorun_evals.load(Ordering::Relaxed),
            autorun_fires: self.autorun_fires.load(Ordering::Relaxed),
            autorun_skips: self.autorun_skips.load(Ordering::Relaxed),
            subscription_faults: self.subscription_faults.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`StoreMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub actions_dispatched: u64,
    pub commits: u64,
    pub noop_commits: u64,
    pub reducer_faults: u64,
    pub autorun_evals: u64,
    pub autorun_fires: u64,
    pub autorun_skips: u64,
    pub subscription_faults: u64,
    pub events_delivered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = StoreMetrics::new();
        metrics.record_dispatch();
        metrics.record_commit();
        metrics.record_dispatch();
        metrics.record_noop();

        let snap = metrics.snapshot();
        assert_eq!(snap.actions_dispatched, 2);
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.noop_commits, 1);
    }

    #[test]
    fn test_skip_rate() {
        let metrics = StoreMetrics::new();
        assert_eq!(metrics.skip_rate(), 0.0);

        metrics.record_autorun_eval();
        metrics.record_autorun_eval();
        metrics.record_autorun_skip();
        assert!((metrics.skip_rate() - 0.5).abs() < f64::EPSILON);
    }
}
