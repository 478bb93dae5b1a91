//! Lock-free service counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared across handlers and reconcilers. All updates are relaxed
/// atomics; readers see eventually consistent snapshots.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests: AtomicU64,
    pub sandboxes_created: AtomicU64,
    pub sandboxes_terminated: AtomicU64,
    pub executions: AtomicU64,
    pub warm_hits: AtomicU64,
    pub warm_misses: AtomicU64,
    pub recycles: AtomicU64,
    pub reconcile_errors: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            sandboxes_created: self.sandboxes_created.load(Ordering::Relaxed),
            sandboxes_terminated: self.sandboxes_terminated.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            warm_hits: self.warm_hits.load(Ordering::Relaxed),
            warm_misses: self.warm_misses.load(Ordering::Relaxed),
            recycles: self.recycles.load(Ordering::Relaxed),
            reconcile_errors: self.reconcile_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub sandboxes_created: u64,
    pub sandboxes_terminated: u64,
    pub executions: u64,
    pub warm_hits: u64,
    pub warm_misses: u64,
    pub recycles: u64,
    pub reconcile_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.requests);
        Metrics::incr(&metrics.requests);
        Metrics::incr(&metrics.warm_hits);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.warm_hits, 1);
        assert_eq!(snap.warm_misses, 0);
    }
}
