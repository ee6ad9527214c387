//! Stress runs of the full threaded pipeline.
//!
//! Drivers run on a real [`opdrive_core::PrepareThread`] and
//! [`opdrive_core::ApplyPool`], with replication reported from other threads.

use crate::fixtures::{ApplyMode, DriverHarness, Launched, PrepareMode};
use crate::operations::TestOperation;
use opdrive_core::{ApplyPoolConfig, CommitMode, PrepareConfig, StatsSnapshot, TransactionDriver};
use serde::Serialize;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressResult {
    /// Operations submitted.
    pub total_ops: usize,
    /// Operations that replied with success.
    pub committed: usize,
    /// Operations that replied with a failure.
    pub failed: usize,
    /// Operations with no reply before the deadline.
    pub missing: usize,
    /// Wall time of the run.
    #[serde(serialize_with = "as_micros")]
    pub duration: Duration,
    /// Replies per second.
    pub ops_per_second: f64,
    /// Driver counters at the end of the run.
    pub stats: StatsSnapshot,
}

fn as_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

impl StressResult {
    fn new(total_ops: usize, committed: usize, failed: usize, duration: Duration, stats: StatsSnapshot) -> Self {
        let done = committed + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            done as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            total_ops,
            committed,
            failed,
            missing: total_ops - done,
            duration,
            ops_per_second,
            stats,
        }
    }

    /// Renders the result as pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Operations: {}", self.total_ops);
        println!("Committed: {}", self.committed);
        println!("Failed: {}", self.failed);
        println!("Missing: {}", self.missing);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per run.
    pub operations: usize,
    /// Threads submitting leader operations.
    pub submitters: usize,
    /// Apply pool threads.
    pub apply_threads: usize,
    /// Prepare thread batch size.
    pub batch_size: usize,
    /// How long to wait for every reply.
    pub deadline: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            submitters: 4,
            apply_threads: 4,
            batch_size: 16,
            deadline: Duration::from_secs(30),
        }
    }
}

fn threaded_harness(config: &StressConfig, commit: CommitMode) -> DriverHarness {
    let capacity = config.operations.max(1);
    DriverHarness::builder()
        .prepare(PrepareMode::Thread(
            PrepareConfig::new()
                .queue_capacity(capacity)
                .max_batch_size(config.batch_size),
        ))
        .apply(ApplyMode::Pool(
            ApplyPoolConfig::new()
                .threads(config.apply_threads)
                .queue_capacity(capacity),
        ))
        .commit(commit)
        .build()
}

fn collect(launched: Vec<Launched>, deadline: Instant) -> (usize, usize) {
    let mut committed = 0;
    let mut failed = 0;
    for l in launched {
        let left = deadline.saturating_duration_since(Instant::now());
        match l.reply.wait_timeout(left) {
            Some(Ok(_)) => committed += 1,
            Some(Err(_)) => failed += 1,
            None => {}
        }
    }
    (committed, failed)
}

/// Submits leader operations from several threads; replication commits
/// immediately on the prepare thread.
pub fn run_leader_stress(config: &StressConfig) -> StressResult {
    let harness = threaded_harness(config, CommitMode::Immediate);
    let start = Instant::now();
    let per_thread = config.operations / config.submitters.max(1);
    let total = per_thread * config.submitters.max(1);

    let launched: Vec<Launched> = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.submitters.max(1))
            .map(|_| {
                scope.spawn(|| {
                    (0..per_thread)
                        .map(|_| harness.start_leader(TestOperation::new()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let (committed, failed) = collect(launched, start + config.deadline);
    let duration = start.elapsed();
    harness.shutdown();
    StressResult::new(total, committed, failed, duration, harness.stats.snapshot())
}

/// Submits follower operations in op index order while another thread reports
/// replication in the same order, racing prepare against replication for
/// every driver. The order verifier checks every apply.
pub fn run_follower_stress(config: &StressConfig) -> StressResult {
    let harness = threaded_harness(config, CommitMode::Manual);
    let start = Instant::now();
    let total = config.operations;

    let launched: Vec<Launched> = thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<Arc<TransactionDriver>>();
        let replicator = scope.spawn(move || {
            for driver in rx {
                driver.replication_finished(Ok(()));
            }
        });

        let mut launched = Vec::with_capacity(total);
        for _ in 0..total {
            let l = harness.start_follower(TestOperation::new());
            let _ = tx.send(Arc::clone(&l.driver));
            launched.push(l);
        }
        drop(tx);
        let _ = replicator.join();
        launched
    });

    let (committed, failed) = collect(launched, start + config.deadline);
    let duration = start.elapsed();
    harness.shutdown();
    StressResult::new(total, committed, failed, duration, harness.stats.snapshot())
}
