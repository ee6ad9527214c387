//! Simulate command implementation.
//!
//! Wires a node out of the in-process collaborators (prepare thread, apply
//! pool, local consensus, memory log, tracker) and pushes a synthetic
//! workload through it. The leader phase replicates through the local
//! consensus; the follower phase replays pre-assigned op ids while a separate
//! thread reports replication, racing each prepare.

use opdrive_core::{
    completion_channel, ApplyPool, ApplyPoolConfig, Clock, CommitMode, Completion,
    CompletionReceiver, ConsistencyMode, DriverConfig, DriverContext, DriverError, DriverOrigin,
    DriverStats, HybridTime, LocalConsensus, LogSyncMode, MemoryLog, OpId, Operation,
    OperationResult, OperationType, PrepareConfig, PrepareThread, StatsSnapshot, SystemClock,
    TrackerConfig, TransactionDriver, TransactionTracker,
};
use rand::Rng;
use serde::Serialize;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    /// A collaborator could not be started or a driver could not be created.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Some operations never replied.
    #[error("{missing} {role} operations did not reply within {timeout:?}")]
    Incomplete {
        /// Phase the operations belonged to.
        role: &'static str,
        /// Operations without a reply.
        missing: usize,
        /// How long the run waited.
        timeout: Duration,
    },
}

/// Workload shape.
#[derive(Debug, Clone, Serialize)]
pub struct SimOptions {
    /// Leader operations.
    pub ops: usize,
    /// Follower operations.
    pub followers: usize,
    /// Apply pool threads.
    pub apply_threads: usize,
    /// Leader rounds per replication batch.
    pub batch_size: usize,
    /// Whether operations use commit wait.
    pub commit_wait: bool,
    /// Upper bound of the random prepare and apply delay.
    pub jitter_us: u64,
}

/// Outcome of one phase.
#[derive(Debug, Serialize)]
pub struct PhaseReport {
    /// `leader` or `follower`.
    pub role: &'static str,
    /// Operations submitted.
    pub operations: usize,
    /// Operations that replied with success.
    pub committed: usize,
    /// Operations that replied with a failure.
    pub failed: usize,
    /// Wall time of the phase, in microseconds.
    pub duration_micros: u64,
    /// Replies per second.
    pub ops_per_second: f64,
    /// Mean time from driver creation to finalize, in microseconds.
    pub mean_commit_latency_micros: u64,
    /// Mean rounds per replication batch.
    pub mean_batch_size: f64,
    /// Durable commit records.
    pub commit_records: usize,
    /// Driver counters.
    pub stats: StatsSnapshot,
}

/// Full simulation report.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// The options the run used.
    pub options: SimOptions,
    /// One entry per phase that ran.
    pub phases: Vec<PhaseReport>,
}

/// A synthetic operation that sleeps for a random time in prepare and apply.
struct SimOperation {
    index: usize,
    consistency: ConsistencyMode,
    jitter_us: u64,
    completion: Option<Completion>,
}

impl SimOperation {
    fn new(index: usize, options: &SimOptions, completion: Completion) -> Self {
        let consistency = if options.commit_wait {
            ConsistencyMode::CommitWait
        } else {
            ConsistencyMode::ClientPropagated
        };
        Self {
            index,
            consistency,
            jitter_us: options.jitter_us,
            completion: Some(completion),
        }
    }

    fn jitter(&self) {
        if self.jitter_us > 0 {
            let micros = rand::thread_rng().gen_range(0..=self.jitter_us);
            thread::sleep(Duration::from_micros(micros));
        }
    }
}

impl Operation for SimOperation {
    fn op_type(&self) -> OperationType {
        OperationType::Write
    }

    fn consistency_mode(&self) -> ConsistencyMode {
        self.consistency
    }

    fn prepare(&mut self) -> Result<(), DriverError> {
        self.jitter();
        Ok(())
    }

    fn start(&mut self, _hybrid_time: HybridTime) -> Result<(), DriverError> {
        Ok(())
    }

    fn replicate_payload(&self) -> Vec<u8> {
        (self.index as u64).to_le_bytes().to_vec()
    }

    fn apply(&mut self, op_id: OpId) -> Result<Vec<u8>, DriverError> {
        self.jitter();
        Ok(op_id.index.to_le_bytes().to_vec())
    }

    fn finish(&mut self, _result: OperationResult) {}

    fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    fn describe(&self) -> String {
        format!("sim write #{}", self.index)
    }
}

/// One simulated node.
struct Node {
    log: Arc<MemoryLog>,
    tracker: Arc<TransactionTracker>,
    stats: Arc<DriverStats>,
    prepare: Arc<PrepareThread>,
    apply: Arc<ApplyPool>,
    ctx: DriverContext,
}

impl Node {
    fn start(options: &SimOptions, peer_id: &str, commit: CommitMode, capacity: usize) -> Result<Self, SimError> {
        let capacity = capacity.max(1);
        let consensus = Arc::new(LocalConsensus::new(commit));
        let log = Arc::new(MemoryLog::new(LogSyncMode::Immediate));
        let tracker = Arc::new(TransactionTracker::new(TrackerConfig::new()));
        let stats = Arc::new(DriverStats::new());
        let prepare = Arc::new(PrepareThread::new(
            PrepareConfig::new()
                .queue_capacity(capacity)
                .max_batch_size(options.batch_size),
            consensus.clone(),
            Arc::clone(&stats),
        )?);
        let apply = Arc::new(ApplyPool::new(
            ApplyPoolConfig::new()
                .threads(options.apply_threads)
                .queue_capacity(capacity),
        )?);
        let ctx = DriverContext::new(
            tracker.clone(),
            consensus,
            log.clone(),
            prepare.clone(),
            apply.clone(),
        )
        .with_stats(Arc::clone(&stats))
        .with_config(DriverConfig::new().tablet_id("sim").peer_id(peer_id));

        Ok(Self {
            log,
            tracker,
            stats,
            prepare,
            apply,
            ctx,
        })
    }

    fn launch(
        &self,
        index: usize,
        options: &SimOptions,
        origin: DriverOrigin,
    ) -> Result<(Arc<TransactionDriver>, CompletionReceiver), SimError> {
        let (completion, reply) = completion_channel();
        let driver = TransactionDriver::new(self.ctx.clone());
        driver.init(Box::new(SimOperation::new(index, options, completion)), origin)?;
        // A refused submission already failed the operation through its reply.
        if let Err(e) = driver.execute_async() {
            warn!(%driver, error = %e, "submission refused");
        }
        Ok((driver, reply))
    }

    fn report(
        &self,
        role: &'static str,
        replies: Vec<CompletionReceiver>,
        started: Instant,
    ) -> Result<PhaseReport, SimError> {
        let operations = replies.len();
        let deadline = started + REPLY_TIMEOUT;
        let mut committed = 0;
        let mut failed = 0;
        for reply in replies {
            match reply.wait_timeout(deadline.saturating_duration_since(Instant::now())) {
                Some(Ok(_)) => committed += 1,
                Some(Err(_)) => failed += 1,
                None => {}
            }
        }
        let duration = started.elapsed();
        let missing = operations - committed - failed;
        if missing > 0 {
            return Err(SimError::Incomplete {
                role,
                missing,
                timeout: REPLY_TIMEOUT,
            });
        }
        self.tracker
            .wait_for_all_to_finish(REPLY_TIMEOUT.saturating_sub(duration))?;
        self.prepare.shutdown();
        self.apply.shutdown();

        let stats = self.stats.snapshot();
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            operations as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Ok(PhaseReport {
            role,
            operations,
            committed,
            failed,
            duration_micros: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
            ops_per_second,
            mean_commit_latency_micros: u64::try_from(stats.mean_commit_latency().as_micros())
                .unwrap_or(u64::MAX),
            mean_batch_size: stats.mean_batch_size(),
            commit_records: self.log.records().len(),
            stats,
        })
    }
}

fn run_leader_phase(options: &SimOptions) -> Result<PhaseReport, SimError> {
    info!(ops = options.ops, batch_size = options.batch_size, "leader phase");
    let node = Node::start(options, "leader", CommitMode::Immediate, options.ops)?;
    let started = Instant::now();
    let mut replies = Vec::with_capacity(options.ops);
    for index in 0..options.ops {
        let (_, reply) = node.launch(index, options, DriverOrigin::Leader)?;
        replies.push(reply);
    }
    node.report("leader", replies, started)
}

fn run_follower_phase(options: &SimOptions) -> Result<PhaseReport, SimError> {
    info!(ops = options.followers, "follower phase");
    let node = Node::start(options, "follower", CommitMode::Manual, options.followers)?;
    let clock = SystemClock::default();
    let started = Instant::now();

    let (tx, rx) = mpsc::channel::<Arc<TransactionDriver>>();
    let replicator = thread::Builder::new()
        .name("replicator".into())
        .spawn(move || {
            for driver in rx {
                driver.replication_finished(Ok(()));
            }
        })
        .map_err(|e| DriverError::illegal_state(format!("cannot spawn replicator: {e}")))?;

    let mut replies = Vec::with_capacity(options.followers);
    for index in 0..options.followers {
        let origin = DriverOrigin::Follower {
            op_id: OpId::new(1, index as u64 + 1),
            hybrid_time: clock.now(),
        };
        let (driver, reply) = node.launch(index, options, origin)?;
        if tx.send(driver).is_err() {
            warn!("replicator stopped early");
        }
        replies.push(reply);
    }
    drop(tx);
    if replicator.join().is_err() {
        warn!("replicator panicked");
    }
    node.report("follower", replies, started)
}

/// Runs the simulate command.
pub fn run(options: &SimOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(options)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }
    Ok(())
}

/// Runs every phase the options ask for.
pub fn simulate(options: &SimOptions) -> Result<SimulationReport, SimError> {
    let mut phases = Vec::new();
    if options.ops > 0 {
        phases.push(run_leader_phase(options)?);
    }
    if options.followers > 0 {
        phases.push(run_follower_phase(options)?);
    }
    Ok(SimulationReport {
        options: options.clone(),
        phases,
    })
}

fn print_text_output(report: &SimulationReport) {
    println!("opdrive simulation");
    println!("==================");
    println!(
        "Apply threads: {}, batch size: {}, commit wait: {}, jitter: {}us",
        report.options.apply_threads,
        report.options.batch_size,
        report.options.commit_wait,
        report.options.jitter_us
    );
    for phase in &report.phases {
        println!();
        println!("[{}]", phase.role);
        println!("Operations:     {}", phase.operations);
        println!("Committed:      {}", phase.committed);
        println!("Failed:         {}", phase.failed);
        println!("Commit records: {}", phase.commit_records);
        println!("Duration:       {:.3} ms", phase.duration_micros as f64 / 1000.0);
        println!("Throughput:     {:.2} ops/sec", phase.ops_per_second);
        println!("Mean latency:   {} us", phase.mean_commit_latency_micros);
        if phase.stats.batches_submitted > 0 {
            println!("Mean batch:     {:.2} rounds", phase.mean_batch_size);
        }
        if phase.stats.commit_waits > 0 {
            println!("Commit waits:   {}", phase.stats.commit_waits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SimOptions {
        SimOptions {
            ops: 64,
            followers: 32,
            apply_threads: 2,
            batch_size: 8,
            commit_wait: false,
            jitter_us: 50,
        }
    }

    #[test]
    fn both_phases_commit_everything() {
        let report = simulate(&options()).unwrap();
        assert_eq!(report.phases.len(), 2);
        for phase in &report.phases {
            assert_eq!(phase.committed, phase.operations);
            assert_eq!(phase.commit_records, phase.operations);
        }
        assert!(report.phases[0].stats.batches_submitted > 0);
        assert_eq!(report.phases[1].stats.batches_submitted, 0);
    }

    #[test]
    fn commit_wait_is_counted() {
        let report = simulate(&SimOptions {
            ops: 4,
            followers: 0,
            commit_wait: true,
            jitter_us: 0,
            ..options()
        })
        .unwrap();
        assert_eq!(report.phases.len(), 1);
        assert_eq!(report.phases[0].stats.commit_waits, 4);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = simulate(&SimOptions {
            apply_threads: 0,
            ..options()
        })
        .unwrap_err();
        assert!(matches!(err, SimError::Driver(DriverError::InvalidArgument { .. })));
    }

    #[test]
    fn report_serializes() {
        let report = simulate(&SimOptions {
            ops: 8,
            followers: 0,
            ..options()
        })
        .unwrap();
        let json = serde_json::to_string_pretty(&report).unwrap();
        assert!(json.contains("\"role\": \"leader\""));
        assert!(json.contains("\"committed\": 8"));
    }
}
