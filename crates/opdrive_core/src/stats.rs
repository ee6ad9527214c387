//! Driver statistics.
//!
//! Counters shared by every driver wired to the same [`DriverContext`].
//!
//! # Usage
//!
//! ```rust,ignore
//! let stats = &ctx.stats;
//! println!("committed: {}", stats.committed());
//! println!("mean latency: {:?}", stats.snapshot().mean_commit_latency());
//! ```
//!
//! [`DriverContext`]: crate::DriverContext

use crate::clock::duration_micros;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Driver statistics.
///
/// All counters are atomic and can be read while operations are in flight.
#[derive(Debug, Default)]
pub struct DriverStats {
    /// Drivers that were initialized.
    started: AtomicU64,
    /// Drivers whose prepare and start hooks succeeded.
    prepared: AtomicU64,
    /// Drivers whose round was committed by replication.
    replicated: AtomicU64,
    /// Drivers whose apply hook ran.
    applied: AtomicU64,
    /// Drivers that finalized.
    committed: AtomicU64,
    /// Drivers that were failed back to the caller.
    failed: AtomicU64,
    /// Abort requests that were recorded.
    aborted: AtomicU64,
    /// Apply tasks the apply executor refused.
    apply_rejections: AtomicU64,
    /// Commit waits performed.
    commit_waits: AtomicU64,
    /// Replication batches submitted by the prepare thread.
    batches_submitted: AtomicU64,
    /// Rounds contained in those batches.
    rounds_submitted: AtomicU64,
    /// Sum of construction-to-finalize latency, in microseconds.
    commit_latency_micros: AtomicU64,
}

impl DriverStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_prepared(&self) {
        self.prepared.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replicated(&self) {
        self.replicated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self, latency: Duration) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        self.commit_latency_micros
            .fetch_add(duration_micros(latency), Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_apply_rejection(&self) {
        self.apply_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_wait(&self) {
        self.commit_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, rounds: usize) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
        self.rounds_submitted
            .fetch_add(u64::try_from(rounds).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Returns the number of initialized drivers.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Returns the number of prepared drivers.
    pub fn prepared(&self) -> u64 {
        self.prepared.load(Ordering::Relaxed)
    }

    /// Returns the number of replicated drivers.
    pub fn replicated(&self) -> u64 {
        self.replicated.load(Ordering::Relaxed)
    }

    /// Returns the number of applied drivers.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Returns the number of finalized drivers.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Returns the number of drivers failed back to their caller.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Returns the number of recorded aborts.
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of rejected apply tasks.
    pub fn apply_rejections(&self) -> u64 {
        self.apply_rejections.load(Ordering::Relaxed)
    }

    /// Returns the number of commit waits.
    pub fn commit_waits(&self) -> u64 {
        self.commit_waits.load(Ordering::Relaxed)
    }

    /// Returns the number of submitted replication batches.
    pub fn batches_submitted(&self) -> u64 {
        self.batches_submitted.load(Ordering::Relaxed)
    }

    /// Returns the number of rounds submitted in batches.
    pub fn rounds_submitted(&self) -> u64 {
        self.rounds_submitted.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started(),
            prepared: self.prepared(),
            replicated: self.replicated(),
            applied: self.applied(),
            committed: self.committed(),
            failed: self.failed(),
            aborted: self.aborted(),
            apply_rejections: self.apply_rejections(),
            commit_waits: self.commit_waits(),
            batches_submitted: self.batches_submitted(),
            rounds_submitted: self.rounds_submitted(),
            commit_latency_micros: self.commit_latency_micros.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of driver statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Initialized drivers.
    pub started: u64,
    /// Prepared drivers.
    pub prepared: u64,
    /// Replicated drivers.
    pub replicated: u64,
    /// Applied drivers.
    pub applied: u64,
    /// Finalized drivers.
    pub committed: u64,
    /// Drivers failed back to their caller.
    pub failed: u64,
    /// Recorded aborts.
    pub aborted: u64,
    /// Rejected apply tasks.
    pub apply_rejections: u64,
    /// Commit waits performed.
    pub commit_waits: u64,
    /// Replication batches submitted.
    pub batches_submitted: u64,
    /// Rounds submitted in batches.
    pub rounds_submitted: u64,
    /// Sum of commit latencies, in microseconds.
    pub commit_latency_micros: u64,
}

impl StatsSnapshot {
    /// Mean construction-to-finalize latency of committed drivers.
    pub fn mean_commit_latency(&self) -> Duration {
        if self.committed == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.commit_latency_micros / self.committed)
    }

    /// Mean number of rounds per replication batch.
    pub fn mean_batch_size(&self) -> f64 {
        if self.batches_submitted == 0 {
            return 0.0;
        }
        self.rounds_submitted as f64 / self.batches_submitted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = DriverStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_lifecycle() {
        let stats = DriverStats::new();

        stats.record_started();
        stats.record_prepared();
        stats.record_replicated();
        stats.record_applied();
        stats.record_committed(Duration::from_micros(300));
        stats.record_started();
        stats.record_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.started, 2);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.mean_commit_latency(), Duration::from_micros(300));
    }

    #[test]
    fn batch_sizes() {
        let stats = DriverStats::new();
        stats.record_batch(4);
        stats.record_batch(2);

        let snap = stats.snapshot();
        assert_eq!(snap.batches_submitted, 2);
        assert_eq!(snap.rounds_submitted, 6);
        assert!((snap.mean_batch_size() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DriverStats::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_started();
                    s.record_applied();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.started(), 800);
        assert_eq!(stats.applied(), 800);
    }
}
