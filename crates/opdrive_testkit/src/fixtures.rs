//! A fully wired driver pipeline for tests.
//!
//! [`DriverHarness`] connects drivers to a [`LocalConsensus`], a
//! [`MemoryLog`], a [`TransactionTracker`] and an [`ApplyOrderVerifier`], with
//! prepare and apply either inline, manual, or on real threads.

use crate::collaborators::{
    InlineExecutor, InlineScheduler, ManualExecutor, ManualScheduler, RejectingExecutor,
    RejectingScheduler,
};
use crate::operations::{OpRecorder, TestOperation};
use opdrive_core::{
    ApplyExecutor, ApplyOrderVerifier, ApplyPool, ApplyPoolConfig, Clock, CommitMode,
    CompletionReceiver, DriverConfig, DriverContext, DriverOrigin, DriverResult, DriverStats,
    FatalPolicy, HybridTime, LocalConsensus, LogSyncMode, MemoryLog, OpId, OrderVerifier,
    PrepareConfig, PrepareScheduler, PrepareThread, SystemClock, TrackerConfig, TransactionDriver,
    TransactionTracker,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

/// How the harness prepares drivers.
#[derive(Debug, Clone, Copy)]
pub enum PrepareMode {
    /// On the thread that calls `execute_async`.
    Inline,
    /// When the test calls [`DriverHarness::run_prepare`].
    Manual,
    /// On a [`PrepareThread`].
    Thread(PrepareConfig),
    /// Never; every driver is refused.
    Rejecting,
}

/// How the harness applies operations.
#[derive(Debug, Clone, Copy)]
pub enum ApplyMode {
    /// On the thread that schedules apply.
    Inline,
    /// When the test calls [`DriverHarness::run_apply`].
    Manual,
    /// Never; every task is refused.
    Rejecting,
    /// On an [`ApplyPool`].
    Pool(ApplyPoolConfig),
}

/// Builds a [`DriverHarness`].
#[must_use]
pub struct HarnessBuilder {
    prepare: PrepareMode,
    apply: ApplyMode,
    commit: CommitMode,
    log: LogSyncMode,
    driver: DriverConfig,
    tracker: TrackerConfig,
    clock: Option<Arc<dyn Clock>>,
    verifier: Option<Arc<dyn OrderVerifier>>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            prepare: PrepareMode::Inline,
            apply: ApplyMode::Inline,
            commit: CommitMode::Manual,
            log: LogSyncMode::Immediate,
            driver: DriverConfig::new().fatal_policy(FatalPolicy::Panic),
            tracker: TrackerConfig::default(),
            clock: None,
            verifier: None,
        }
    }
}

impl HarnessBuilder {
    /// Sets how drivers are prepared.
    pub fn prepare(mut self, mode: PrepareMode) -> Self {
        self.prepare = mode;
        self
    }

    /// Sets how operations are applied.
    pub fn apply(mut self, mode: ApplyMode) -> Self {
        self.apply = mode;
        self
    }

    /// Sets when the local consensus commits rounds.
    pub fn commit(mut self, mode: CommitMode) -> Self {
        self.commit = mode;
        self
    }

    /// Sets when the commit log reports records durable.
    pub fn log(mut self, mode: LogSyncMode) -> Self {
        self.log = mode;
        self
    }

    /// Sets the driver configuration. Defaults to [`FatalPolicy::Panic`].
    pub fn driver_config(mut self, config: DriverConfig) -> Self {
        self.driver = config;
        self
    }

    /// Sets the tracker configuration.
    pub fn tracker(mut self, config: TrackerConfig) -> Self {
        self.tracker = config;
        self
    }

    /// Replaces the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the order verifier.
    pub fn order_verifier(mut self, verifier: Arc<dyn OrderVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Wires everything up.
    ///
    /// # Panics
    ///
    /// Panics if a prepare thread or apply pool cannot be started.
    pub fn build(self) -> DriverHarness {
        init_test_logging();

        let consensus = Arc::new(LocalConsensus::new(self.commit));
        let log = Arc::new(MemoryLog::new(self.log));
        let tracker = Arc::new(TransactionTracker::new(self.tracker));
        let stats = Arc::new(DriverStats::new());
        let verifier = Arc::new(ApplyOrderVerifier::new());

        let mut manual_prepare = None;
        let mut prepare_thread = None;
        let prepare: Arc<dyn PrepareScheduler> = match self.prepare {
            PrepareMode::Inline => Arc::new(InlineScheduler),
            PrepareMode::Manual => {
                let scheduler = Arc::new(ManualScheduler::new());
                manual_prepare = Some(Arc::clone(&scheduler));
                scheduler
            }
            PrepareMode::Thread(config) => {
                let thread = Arc::new(
                    PrepareThread::new(config, consensus.clone(), Arc::clone(&stats))
                        .expect("start prepare thread"),
                );
                prepare_thread = Some(Arc::clone(&thread));
                thread
            }
            PrepareMode::Rejecting => Arc::new(RejectingScheduler),
        };

        let mut manual_apply = None;
        let mut apply_pool = None;
        let apply: Arc<dyn ApplyExecutor> = match self.apply {
            ApplyMode::Inline => Arc::new(InlineExecutor::new()),
            ApplyMode::Manual => {
                let executor = Arc::new(ManualExecutor::new());
                manual_apply = Some(Arc::clone(&executor));
                executor
            }
            ApplyMode::Rejecting => Arc::new(RejectingExecutor::new()),
            ApplyMode::Pool(config) => {
                let pool = Arc::new(ApplyPool::new(config).expect("start apply pool"));
                apply_pool = Some(Arc::clone(&pool));
                pool
            }
        };

        let order: Arc<dyn OrderVerifier> = match self.verifier {
            Some(custom) => custom,
            None => verifier.clone(),
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::default()) as Arc<dyn Clock>);

        tracing::debug!(prepare = ?self.prepare, apply = ?self.apply, commit = ?self.commit, "harness built");
        let ctx = DriverContext::new(tracker.clone(), consensus.clone(), log.clone(), prepare, apply)
            .with_order_verifier(order)
            .with_clock(clock)
            .with_stats(Arc::clone(&stats))
            .with_config(self.driver);

        DriverHarness {
            consensus,
            log,
            tracker,
            stats,
            verifier,
            manual_prepare,
            manual_apply,
            prepare_thread,
            apply_pool,
            ctx,
            next_follower_index: AtomicU64::new(1),
        }
    }
}

/// A driver started by the harness, with its reply channel and recorder.
#[derive(Debug)]
pub struct Launched {
    /// The driver.
    pub driver: Arc<TransactionDriver>,
    /// Receives the operation's terminal status.
    pub reply: CompletionReceiver,
    /// Observes the operation's hooks.
    pub recorder: Arc<OpRecorder>,
}

/// A wired pipeline of collaborators shared by every driver it creates.
pub struct DriverHarness {
    /// Replication port; rounds stay pending in [`CommitMode::Manual`].
    pub consensus: Arc<LocalConsensus>,
    /// Commit log.
    pub log: Arc<MemoryLog>,
    /// Registry of live drivers.
    pub tracker: Arc<TransactionTracker>,
    /// Shared counters.
    pub stats: Arc<DriverStats>,
    /// The default order verifier, even when a custom one is wired in.
    pub verifier: Arc<ApplyOrderVerifier>,
    manual_prepare: Option<Arc<ManualScheduler>>,
    manual_apply: Option<Arc<ManualExecutor>>,
    prepare_thread: Option<Arc<PrepareThread>>,
    apply_pool: Option<Arc<ApplyPool>>,
    ctx: DriverContext,
    next_follower_index: AtomicU64,
}

impl DriverHarness {
    /// Creates a harness with inline prepare and apply, manual commit and an
    /// immediately durable log.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a harness.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Returns the context every driver of this harness shares.
    pub fn ctx(&self) -> &DriverContext {
        &self.ctx
    }

    /// Creates and initializes a leader driver without executing it.
    ///
    /// # Errors
    ///
    /// Returns the error from `init`.
    pub fn init_leader(&self, op: TestOperation) -> DriverResult<Launched> {
        self.init(op, DriverOrigin::Leader)
    }

    /// Creates and initializes a follower driver at the next op index.
    ///
    /// # Errors
    ///
    /// Returns the error from `init`.
    pub fn init_follower(&self, op: TestOperation) -> DriverResult<Launched> {
        let index = self.next_follower_index.fetch_add(1, Ordering::SeqCst);
        let origin = DriverOrigin::Follower {
            op_id: OpId::new(1, index),
            hybrid_time: HybridTime::from_micros(index * 10),
        };
        self.init(op, origin)
    }

    /// Initializes a leader driver and executes it.
    ///
    /// # Panics
    ///
    /// Panics if `init` or `execute_async` fails.
    pub fn start_leader(&self, op: TestOperation) -> Launched {
        let launched = self.init_leader(op).expect("init leader");
        launched.driver.execute_async().expect("execute leader");
        launched
    }

    /// Initializes a follower driver and executes it.
    ///
    /// # Panics
    ///
    /// Panics if `init` or `execute_async` fails.
    pub fn start_follower(&self, op: TestOperation) -> Launched {
        let launched = self.init_follower(op).expect("init follower");
        launched.driver.execute_async().expect("execute follower");
        launched
    }

    /// Creates an uninitialized driver.
    pub fn new_driver(&self) -> Arc<TransactionDriver> {
        TransactionDriver::new(self.ctx.clone())
    }

    fn init(&self, op: TestOperation, origin: DriverOrigin) -> DriverResult<Launched> {
        let recorder = op.recorder();
        let (op, reply) = op.with_reply();
        let driver = self.new_driver();
        driver.init(Box::new(op), origin)?;
        Ok(Launched { driver, reply, recorder })
    }

    /// Prepares the oldest queued driver in [`PrepareMode::Manual`].
    ///
    /// # Panics
    ///
    /// Panics in any other mode.
    pub fn run_prepare(&self) -> bool {
        self.manual_prepare
            .as_ref()
            .expect("harness built with PrepareMode::Manual")
            .run_next()
    }

    /// Returns the number of drivers waiting for prepare in
    /// [`PrepareMode::Manual`], or 0.
    pub fn pending_prepare(&self) -> usize {
        self.manual_prepare.as_ref().map_or(0, |s| s.pending())
    }

    /// Runs the oldest queued apply task in [`ApplyMode::Manual`].
    ///
    /// # Panics
    ///
    /// Panics in any other mode.
    pub fn run_apply(&self) -> bool {
        self.manual_apply
            .as_ref()
            .expect("harness built with ApplyMode::Manual")
            .run_next()
    }

    /// Returns the number of queued apply tasks in [`ApplyMode::Manual`], or 0.
    pub fn pending_apply(&self) -> usize {
        self.manual_apply.as_ref().map_or(0, |e| e.pending())
    }

    /// Returns how many apply tasks were submitted in [`ApplyMode::Manual`],
    /// or 0.
    pub fn apply_submissions(&self) -> usize {
        self.manual_apply.as_ref().map_or(0, |e| e.submitted())
    }

    /// Waits for every live driver to finish.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` if drivers are still live after `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> DriverResult<()> {
        self.tracker.wait_for_all_to_finish(timeout)
    }

    /// Stops the prepare thread and apply pool, if any, after they drain.
    pub fn shutdown(&self) {
        if let Some(thread) = &self.prepare_thread {
            thread.shutdown();
        }
        if let Some(pool) = &self.apply_pool {
            pool.shutdown();
        }
    }
}

impl Default for DriverHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DriverHarness {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DriverHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHarness")
            .field("tracker", &self.tracker)
            .field("consensus", &self.consensus)
            .finish_non_exhaustive()
    }
}

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`; silent by default.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
