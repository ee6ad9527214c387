//! The per-operation transaction driver.
//!
//! A [`TransactionDriver`] carries one [`Operation`] from prepare through
//! replication and apply to a durable, visible commit. Two completion events
//! gate apply: prepare finishing on the prepare thread, and replication
//! finishing on whatever thread the replication port reports from. They may
//! arrive in either order or concurrently. Both are evaluated under the
//! driver's state lock, so exactly one of them schedules apply.
//!
//! ```text
//! leader:   init -> execute_async -> prepare_and_start -> [replicating]
//!             -> replication_finished(Ok) -> apply -> commit record -> finalize
//! follower: init(Follower) -> execute_async -> prepare_and_start
//!             \-> replication_finished(Ok) arrives before or after prepare
//! ```
//!
//! Locks: the operation lock may be held while taking the state lock, and the
//! state lock while taking the op id lock. Never the other way round, and no
//! lock is held while calling a collaborator that may call back. The
//! completion lock is only held to take the reply out.

mod context;
pub mod state;

pub use context::DriverContext;
pub use state::{DriverOrigin, Outcome, PrepareState, ReplicationState};

use crate::clock::monotonic_micros;
use crate::commit_log::CommitRecord;
use crate::config::FatalPolicy;
use crate::consensus::{ReplicateMsg, ReplicationRound};
use crate::error::{DriverError, DriverResult};
use crate::operation::{Completion, Operation};
use crate::trace::Trace;
use crate::types::{
    CommitSummary, ConsistencyMode, DriverId, HybridTime, OpId, OperationResult, OperationType,
};
use parking_lot::Mutex;
use state::{AbortAction, FailureAction, PrepareAction, ReplicationAction, StateMachine};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    machine: StateMachine,
    op_type: OperationType,
    hybrid_time: Option<HybridTime>,
    prepare_micros: u64,
}

/// Drives one operation through prepare, replication, apply and finalize.
///
/// Drivers are shared: the registry, the prepare queue, the replication round
/// and the apply task each hold an `Arc`, and the driver is dropped when the
/// last of them lets go.
pub struct TransactionDriver {
    id: DriverId,
    ctx: DriverContext,
    state: Mutex<Option<Inner>>,
    // Polled from outside; kept off the state lock.
    op_id: Mutex<OpId>,
    operation: Mutex<Option<Box<dyn Operation>>>,
    // Taken from the operation at init so replies never wait on hooks.
    completion: Mutex<Option<Completion>>,
    finished: AtomicBool,
    start_time: Instant,
    trace: Arc<Trace>,
}

impl TransactionDriver {
    /// Creates an uninitialized driver.
    pub fn new(ctx: DriverContext) -> Arc<Self> {
        Arc::new(Self {
            id: DriverId(NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed)),
            ctx,
            state: Mutex::new(None),
            op_id: Mutex::new(OpId::UNSET),
            operation: Mutex::new(None),
            completion: Mutex::new(None),
            finished: AtomicBool::new(false),
            start_time: Instant::now(),
            trace: Arc::new(Trace::new()),
        })
    }

    /// Binds the driver to its operation and registers it.
    ///
    /// A follower driver starts out replicating, with the op id and hybrid
    /// time the leader assigned.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if the driver was already initialized,
    /// `InvalidArgument` for a follower without an op id, or the registry's
    /// admission error.
    pub fn init(self: &Arc<Self>, mut operation: Box<dyn Operation>, origin: DriverOrigin) -> DriverResult<()> {
        {
            let mut state = self.state.lock();
            if state.is_some() {
                return Err(DriverError::illegal_state("driver already initialized"));
            }
            let hybrid_time = match origin {
                DriverOrigin::Leader => None,
                DriverOrigin::Follower { op_id, hybrid_time } => {
                    if !op_id.is_set() {
                        return Err(DriverError::invalid_argument("follower driver needs an op id"));
                    }
                    *self.op_id.lock() = op_id;
                    Some(hybrid_time)
                }
            };
            *state = Some(Inner {
                machine: StateMachine::new(origin),
                op_type: operation.op_type(),
                hybrid_time,
                prepare_micros: 0,
            });
        }
        *self.completion.lock() = operation.take_completion();
        *self.operation.lock() = Some(operation);

        if let Err(e) = self.ctx.registry.add(self) {
            *self.state.lock() = None;
            *self.op_id.lock() = OpId::UNSET;
            self.operation.lock().take();
            self.completion.lock().take();
            return Err(e);
        }

        self.ctx.stats.record_started();
        self.trace.message(if origin.is_leader() { "Init (leader)" } else { "Init (follower)" });
        debug!(driver = %self, "driver initialized");
        Ok(())
    }

    /// Hands the driver to the prepare scheduler. Never blocks.
    ///
    /// On a submission error the operation is also failed back through its
    /// completion and released, so later stages never see it.
    ///
    /// # Errors
    ///
    /// Returns the scheduler's error, or `IllegalState` if the driver is not
    /// initialized, was already submitted or already ran prepare.
    pub fn execute_async(self: &Arc<Self>) -> DriverResult<()> {
        self.with_state(|s| s.machine.begin_submit())?;
        self.trace.message("ExecuteAsync");
        if let Err(e) = self.ctx.prepare.submit(Arc::clone(self)) {
            warn!(driver = %self, error = %e, "prepare submission failed");
            self.handle_failure(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Runs the operation's prepare and start hooks.
    ///
    /// For a leader-side driver this returns the replication round the caller
    /// must hand to the replication port; the driver is already marked
    /// replicating. Returns `None` otherwise; if replication already
    /// committed, apply has been scheduled. A repeated delivery of an
    /// already prepared driver is logged and returns `None`.
    ///
    /// # Errors
    ///
    /// Returns the hook's error, or the recorded status if the driver already
    /// completed. The caller passes it to [`TransactionDriver::handle_failure`].
    pub fn prepare_and_start(self: &Arc<Self>) -> DriverResult<Option<ReplicationRound>> {
        let prepared = self.run_prepare_hooks();
        // A failure that arrived while the hooks ran left finish to us.
        self.finish_if_failed();
        let Some((action, msg)) = prepared? else {
            return Ok(None);
        };

        self.ctx.stats.record_prepared();
        self.trace.message("PrepareAndStart done");
        debug!(driver = %self, "prepared");

        match (action, msg) {
            (PrepareAction::SubmitReplication, Some(msg)) => Ok(Some(self.replication_round(msg))),
            (PrepareAction::Apply, _) => {
                self.apply_async();
                Ok(None)
            }
            (PrepareAction::Fail(e), _) => Err(e),
            _ => Ok(None),
        }
    }

    fn run_prepare_hooks(
        self: &Arc<Self>,
    ) -> DriverResult<Option<(PrepareAction, Option<ReplicateMsg>)>> {
        let mut operation = self.operation.lock();
        // Checked under the operation lock, so an abort that already
        // failed the operation keeps the hooks from running.
        let origin = self.with_state(|s| {
            if s.machine.prepare() == PrepareState::Prepared && !s.machine.is_terminal() {
                return Ok(None);
            }
            s.machine.begin_prepare()?;
            Ok(Some(s.machine.origin()))
        })?;
        let Some(origin) = origin else {
            drop(operation);
            warn!(driver = %self, "duplicate prepare ignored");
            return Ok(None);
        };
        let op = operation
            .as_mut()
            .ok_or_else(|| DriverError::illegal_state("driver has no operation"))?;

        op.prepare()?;
        let hybrid_time = match origin {
            DriverOrigin::Leader => self.ctx.clock.now(),
            DriverOrigin::Follower { hybrid_time, .. } => hybrid_time,
        };
        op.start(hybrid_time)?;
        let prepare_micros = monotonic_micros();

        let (action, order) = self.with_state(|s| {
            s.hybrid_time = Some(hybrid_time);
            s.prepare_micros = prepare_micros;
            let action = s.machine.on_prepared()?;
            let order = match action {
                PrepareAction::Apply => self.check_apply_order(s),
                _ => Ok(()),
            };
            Ok((action, order))
        })?;
        if let Err(e) = order {
            drop(operation);
            self.handle_failure(e);
            return Ok(None);
        }

        let msg = matches!(action, PrepareAction::SubmitReplication).then(|| ReplicateMsg {
            op_type: op.op_type(),
            hybrid_time,
            payload: op.replicate_payload(),
        });
        Ok(Some((action, msg)))
    }

    /// Prepares the driver and, for a leader, submits its round alone.
    ///
    /// Used on the unbatched path. Failures are routed to
    /// [`TransactionDriver::handle_failure`].
    pub fn prepare_and_start_task(self: &Arc<Self>) {
        match self.prepare_and_start() {
            Ok(Some(round)) => {
                if let Err(e) = self.ctx.replication.replicate_batch(vec![round]) {
                    warn!(driver = %self, error = %e, "replication submission failed");
                    self.set_replication_failed(e.clone());
                    self.handle_failure(e);
                }
            }
            Ok(None) => {}
            Err(e) => self.handle_failure(e),
        }
    }

    /// Records that the round was never accepted by the replication port.
    /// Must be followed by [`TransactionDriver::handle_failure`].
    pub fn set_replication_failed(&self, status: DriverError) {
        match self.with_state(|s| s.machine.on_replication_submit_failed(status.clone())) {
            Ok(()) => self.trace.message(format!("Replication not submitted: {status}")),
            Err(e) => error!(driver = %self, error = %e, "cannot mark replication failed"),
        }
    }

    /// Receives the replication outcome. Delivered at most once; later
    /// deliveries are logged and ignored.
    pub fn replication_finished(self: &Arc<Self>, status: DriverResult<()>) {
        let failed = status.as_ref().err().cloned();
        let decided = self.with_state(|s| {
            let action = s.machine.on_replication_finished(status)?;
            let order = match action {
                ReplicationAction::Apply => self.check_apply_order(s),
                _ => Ok(()),
            };
            Ok((action, order))
        });
        let (action, order) = match decided {
            Ok(decided) => decided,
            Err(e) => {
                error!(driver = %self, error = %e, "unexpected replication outcome");
                return;
            }
        };

        match &failed {
            None => {
                self.ctx.stats.record_replicated();
                self.trace.message(format!("Replicated at {}", self.op_id()));
            }
            Some(e) => self.trace.message(format!("Replication failed: {e}")),
        }

        if let Err(e) = order {
            self.handle_failure(e);
            return;
        }
        match action {
            ReplicationAction::Apply => self.apply_async(),
            ReplicationAction::AwaitPrepare => debug!(driver = %self, "replicated, waiting for prepare"),
            ReplicationAction::Fail(e) => self.handle_failure(e),
        }
    }

    /// Notification that the replication layer appended the round locally at
    /// `op_id`.
    pub fn handle_consensus_append(&self, op_id: OpId) {
        self.assign_op_id(op_id);
        self.trace.message(format!("Appended at {op_id}"));
    }

    /// Requests that the operation be aborted.
    ///
    /// Before replication this fails the operation immediately. While
    /// replication is in flight the round cannot be recalled; the abort only
    /// keeps a success from being reported. After replication it is ignored.
    pub fn abort(&self, status: DriverError) {
        let action = match self.with_state(|s| Ok(s.machine.on_abort(status.clone()))) {
            Ok(action) => action,
            Err(e) => {
                warn!(driver = %self, error = %e, "abort ignored");
                return;
            }
        };
        match action {
            AbortAction::FailNow => {
                self.ctx.stats.record_aborted();
                self.trace.message(format!("Aborted: {status}"));
                self.handle_failure(status);
            }
            AbortAction::Deferred => {
                self.ctx.stats.record_aborted();
                self.trace.message(format!("Abort recorded while replicating: {status}"));
                debug!(driver = %self, "abort deferred until replication reports");
            }
            AbortAction::Ignored => debug!(driver = %self, error = %status, "abort ignored"),
        }
    }

    /// Fails the operation back to its caller if nothing was replicated.
    ///
    /// Once replication may have committed, a failure is unrecoverable and
    /// is handled per [`FatalPolicy`]. Only the first terminal outcome takes
    /// effect.
    pub fn handle_failure(&self, status: DriverError) {
        let decided = self.with_state(|s| {
            let action = s.machine.on_failure(status.clone());
            Ok((action, s.machine.status().cloned()))
        });
        let (action, recorded) = match decided {
            Ok(decided) => decided,
            Err(e) => {
                warn!(driver = %self, error = %e, failure = %status, "failure on uninitialized driver");
                return;
            }
        };
        match action {
            FailureAction::Release => self.fail_operation(recorded.unwrap_or(status)),
            FailureAction::Fatal => self.fatal(&status),
            FailureAction::AlreadyTerminal => {
                debug!(driver = %self, error = %status, "failure after completion ignored");
            }
        }
    }

    /// Returns the op id, or `OpId::UNSET` before replication assigned one.
    pub fn op_id(&self) -> OpId {
        *self.op_id.lock()
    }

    /// Returns the driver's process-unique id.
    pub fn id(&self) -> DriverId {
        self.id
    }

    /// Returns the operation kind, once initialized.
    pub fn op_type(&self) -> Option<OperationType> {
        self.state.lock().as_ref().map(|s| s.op_type)
    }

    /// Returns the origin, once initialized.
    pub fn origin(&self) -> Option<DriverOrigin> {
        self.state.lock().as_ref().map(|s| s.machine.origin())
    }

    /// Returns the hybrid time, once assigned.
    pub fn hybrid_time(&self) -> Option<HybridTime> {
        self.state.lock().as_ref().and_then(|s| s.hybrid_time)
    }

    /// Returns the replication state, once initialized.
    pub fn replication_state(&self) -> Option<ReplicationState> {
        self.state.lock().as_ref().map(|s| s.machine.replication())
    }

    /// Returns the prepare state, once initialized.
    pub fn prepare_state(&self) -> Option<PrepareState> {
        self.state.lock().as_ref().map(|s| s.machine.prepare())
    }

    /// Returns the terminal outcome, if reached.
    pub fn outcome(&self) -> Option<Outcome> {
        self.state.lock().as_ref().and_then(|s| s.machine.outcome())
    }

    /// Returns true if this node still has to replicate the operation.
    pub fn is_leader_side(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|s| s.machine.is_leader_side())
    }

    /// Short state summary such as `R-NP`.
    pub fn state_string(&self) -> String {
        self.state
            .lock()
            .as_ref()
            .map_or_else(|| "UNINIT".to_owned(), |s| s.machine.state_string())
    }

    /// Prefix for log lines about this driver.
    pub fn log_prefix(&self) -> String {
        format!(
            "T {} P {} S {}: ",
            self.ctx.config.tablet_id,
            self.ctx.config.peer_id,
            self.state_string()
        )
    }

    /// Returns when the driver was created.
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Returns the lifecycle trace.
    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }

    /// Returns the driver's collaborators.
    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut Inner) -> DriverResult<R>) -> DriverResult<R> {
        let mut state = self.state.lock();
        let inner = state
            .as_mut()
            .ok_or_else(|| DriverError::illegal_state("driver not initialized"))?;
        f(inner)
    }

    // Runs under the state lock of the driver that decided to apply, so
    // checks happen in the order apply is decided.
    fn check_apply_order(&self, inner: &Inner) -> DriverResult<()> {
        if inner.machine.origin().is_leader() {
            return Ok(());
        }
        self.ctx
            .order_verifier
            .check_apply(self.op_id().index, inner.prepare_micros)
    }

    fn assign_op_id(&self, op_id: OpId) {
        let mut current = self.op_id.lock();
        if !current.is_set() {
            *current = op_id;
        } else if *current != op_id {
            let assigned = *current;
            warn!(driver = %self.id, %assigned, requested = %op_id, "op id already assigned");
        }
    }

    fn replication_round(self: &Arc<Self>, msg: ReplicateMsg) -> ReplicationRound {
        let appended = Arc::clone(self);
        let finished = Arc::clone(self);
        ReplicationRound::new(
            msg,
            Box::new(move |op_id| appended.handle_consensus_append(op_id)),
            Box::new(move |op_id, status| {
                if op_id.is_set() {
                    finished.assign_op_id(op_id);
                }
                finished.replication_finished(status);
            }),
        )
    }

    pub(crate) fn apply_async(self: &Arc<Self>) {
        self.trace.message("ApplyAsync");
        let driver = Arc::clone(self);
        if let Err(e) = self.ctx.apply.submit(Box::new(move || driver.apply_task())) {
            let status = DriverError::apply_rejected(e.to_string());
            let rejected = self
                .with_state(|s| Ok(s.machine.on_apply_rejected(status.clone())))
                .unwrap_or(false);
            if rejected {
                warn!(driver = %self, error = %e, "apply task rejected");
                self.ctx.stats.record_apply_rejection();
                self.fail_operation(status);
            }
        }
    }

    pub(crate) fn apply_task(self: &Arc<Self>) {
        let op_id = self.op_id();
        self.trace.message(format!("ApplyTask at {op_id}"));

        let applied = {
            let mut operation = self.operation.lock();
            match operation.as_mut() {
                Some(op) => op.apply(op_id).map(|result| (result, op.consistency_mode())),
                None => Err(DriverError::illegal_state("driver has no operation")),
            }
        };
        let (result, mode) = match applied {
            Ok(applied) => applied,
            Err(e) => {
                self.handle_failure(e);
                return;
            }
        };
        self.ctx.stats.record_applied();

        let stamped = self.with_state(|s| {
            s.hybrid_time
                .map(|ht| (s.op_type, ht))
                .ok_or_else(|| DriverError::illegal_state("applied without a hybrid time"))
        });
        let (op_type, hybrid_time) = match stamped {
            Ok(stamped) => stamped,
            Err(e) => {
                self.handle_failure(e);
                return;
            }
        };

        if mode == ConsistencyMode::CommitWait {
            self.commit_wait(hybrid_time);
        }

        let record = CommitRecord {
            op_id,
            op_type,
            hybrid_time,
            result,
        };
        let driver = Arc::clone(self);
        let on_durable = Box::new(move |status: DriverResult<()>| match status {
            Ok(()) => driver.finalize(hybrid_time),
            Err(e) => driver.handle_failure(e),
        });
        if let Err(e) = self.ctx.log.append_commit(record, on_durable) {
            self.handle_failure(DriverError::log_append_failed(e.to_string()));
        }
    }

    // Blocks the apply thread until the clock has certainly passed the
    // operation's hybrid time. Proceeds on timeout.
    pub(crate) fn commit_wait(&self, hybrid_time: HybridTime) {
        self.ctx.stats.record_commit_wait();
        let started = Instant::now();
        let deadline = started + self.ctx.config.commit_wait_timeout;
        match self.ctx.clock.wait_until_after(hybrid_time, deadline) {
            Ok(()) => self
                .trace
                .message(format!("CommitWait done in {:?}", started.elapsed())),
            Err(e) => {
                warn!(driver = %self, error = %e, "commit wait incomplete, proceeding");
                self.trace.message(format!("CommitWait gave up: {e}"));
            }
        }
    }

    pub(crate) fn finalize(&self, hybrid_time: HybridTime) {
        let late_abort = match self.with_state(|s| s.machine.on_finalized()) {
            Ok(late_abort) => late_abort,
            Err(e) => {
                error!(driver = %self, error = %e, "finalize rejected");
                return;
            }
        };

        self.finish_operation(&mut self.operation.lock(), OperationResult::Committed);

        let reply = match late_abort {
            Some(status) => Err(DriverError::aborted_after_replication(
                status.abort_reason().unwrap_or_default(),
            )),
            None => Ok(CommitSummary {
                op_id: self.op_id(),
                hybrid_time,
            }),
        };
        self.reply(reply);

        let latency = self.start_time.elapsed();
        self.ctx.stats.record_committed(latency);
        self.trace.message("Finalized");
        debug!(driver = %self, ?latency, "finalized");
        self.ctx.registry.release(self);
    }

    fn fail_operation(&self, status: DriverError) {
        // Busy only while prepare hooks run; that thread finishes the
        // operation once they return.
        match self.operation.try_lock() {
            Some(mut operation) => self.finish_operation(&mut operation, OperationResult::Aborted),
            None => debug!(driver = %self, "operation busy, finish deferred"),
        }
        self.reply(Err(status.clone()));

        self.ctx.stats.record_failed();
        self.trace.message(format!("Failed: {status}"));
        debug!(driver = %self, error = %status, "operation failed");
        self.ctx.registry.release(self);
    }

    fn finish_if_failed(&self) {
        if self.finished.load(Ordering::Acquire) || self.outcome() != Some(Outcome::Failed) {
            return;
        }
        self.finish_operation(&mut self.operation.lock(), OperationResult::Aborted);
    }

    // Runs the operation's finish hook at most once.
    fn finish_operation(
        &self,
        operation: &mut Option<Box<dyn Operation>>,
        result: OperationResult,
    ) {
        if let Some(op) = operation.as_mut() {
            if !self.finished.swap(true, Ordering::AcqRel) {
                op.finish(result);
            }
        }
    }

    fn reply(&self, reply: DriverResult<CommitSummary>) {
        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            completion(reply);
        }
    }

    fn fatal(&self, status: &DriverError) {
        error!(
            driver = %self,
            error = %status,
            "{}failure after the operation may have been replicated",
            self.log_prefix()
        );
        match self.ctx.config.fatal_policy {
            FatalPolicy::Abort => std::process::abort(),
            FatalPolicy::Panic => panic!("{}unrecoverable failure: {status}", self.log_prefix()),
        }
    }
}

impl fmt::Display for TransactionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, op_type) = match self.state.lock().as_ref() {
            Some(s) => (s.machine.state_string(), s.op_type.to_string()),
            None => ("UNINIT".to_owned(), "-".to_owned()),
        };
        write!(f, "{} {} [{}] {}", self.id, self.op_id(), state, op_type)
    }
}

impl fmt::Debug for TransactionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionDriver")
            .field("id", &self.id)
            .field("op_id", &self.op_id())
            .field("state", &self.state_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{ApplyExecutor, ApplyTask};
    use crate::commit_log::{LogSyncMode, MemoryLog};
    use crate::config::{DriverConfig, TrackerConfig};
    use crate::consensus::{CommitMode, LocalConsensus};
    use crate::operation::{completion_channel, Completion, CompletionReceiver};
    use crate::prepare::PrepareScheduler;
    use crate::tracker::TransactionTracker;

    struct Inline;

    impl PrepareScheduler for Inline {
        fn submit(&self, driver: Arc<TransactionDriver>) -> DriverResult<()> {
            driver.prepare_and_start_task();
            Ok(())
        }
    }

    impl ApplyExecutor for Inline {
        fn submit(&self, task: ApplyTask) -> DriverResult<()> {
            task();
            Ok(())
        }
    }

    struct Rejecting;

    impl ApplyExecutor for Rejecting {
        fn submit(&self, _task: ApplyTask) -> DriverResult<()> {
            Err(DriverError::service_unavailable("apply queue is full"))
        }
    }

    struct Noop {
        completion: Option<Completion>,
        finished: Arc<Mutex<Vec<OperationResult>>>,
    }

    impl Operation for Noop {
        fn op_type(&self) -> OperationType {
            OperationType::Write
        }
        fn prepare(&mut self) -> DriverResult<()> {
            Ok(())
        }
        fn start(&mut self, _hybrid_time: HybridTime) -> DriverResult<()> {
            Ok(())
        }
        fn replicate_payload(&self) -> Vec<u8> {
            b"noop".to_vec()
        }
        fn apply(&mut self, _op_id: OpId) -> DriverResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn finish(&mut self, result: OperationResult) {
            self.finished.lock().push(result);
        }
        fn take_completion(&mut self) -> Option<Completion> {
            self.completion.take()
        }
    }

    struct Setup {
        consensus: Arc<LocalConsensus>,
        log: Arc<MemoryLog>,
        tracker: Arc<TransactionTracker>,
        ctx: DriverContext,
    }

    fn setup(apply: Arc<dyn ApplyExecutor>) -> Setup {
        let consensus = Arc::new(LocalConsensus::new(CommitMode::Manual));
        let log = Arc::new(MemoryLog::new(LogSyncMode::Immediate));
        let tracker = Arc::new(TransactionTracker::new(TrackerConfig::default()));
        let ctx = DriverContext::new(
            tracker.clone(),
            consensus.clone(),
            log.clone(),
            Arc::new(Inline),
            apply,
        )
        .with_config(DriverConfig::new().fatal_policy(FatalPolicy::Panic));
        Setup {
            consensus,
            log,
            tracker,
            ctx,
        }
    }

    fn operation() -> (Box<dyn Operation>, CompletionReceiver, Arc<Mutex<Vec<OperationResult>>>) {
        let (completion, receiver) = completion_channel();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let op = Noop {
            completion: Some(completion),
            finished: Arc::clone(&finished),
        };
        (Box::new(op), receiver, finished)
    }

    #[test]
    fn leader_commits() {
        let s = setup(Arc::new(Inline));
        let driver = TransactionDriver::new(s.ctx.clone());
        let (op, reply, finished) = operation();
        driver.init(op, DriverOrigin::Leader).unwrap();
        assert_eq!(s.tracker.pending_count(), 1);
        assert!(driver.is_leader_side());

        driver.execute_async().unwrap();
        assert_eq!(driver.state_string(), "R-P");
        assert_eq!(driver.op_id(), OpId::new(1, 1));

        s.consensus.commit_all();
        let summary = reply.wait().unwrap();
        assert_eq!(summary.op_id, OpId::new(1, 1));
        assert_eq!(Some(summary.hybrid_time), driver.hybrid_time());
        assert_eq!(*finished.lock(), vec![OperationResult::Committed]);
        assert_eq!(s.log.records().len(), 1);
        assert_eq!(driver.outcome(), Some(Outcome::Finalized));
        assert_eq!(s.tracker.pending_count(), 0);
        assert!(driver.trace().contains("Finalized"));
    }

    #[test]
    fn init_twice_is_rejected() {
        let s = setup(Arc::new(Inline));
        let driver = TransactionDriver::new(s.ctx.clone());
        let (op, _reply, _) = operation();
        driver.init(op, DriverOrigin::Leader).unwrap();
        let (op, _reply, _) = operation();
        let err = driver.init(op, DriverOrigin::Leader).unwrap_err();
        assert!(matches!(err, DriverError::IllegalState { .. }));
    }

    #[test]
    fn follower_needs_op_id() {
        let s = setup(Arc::new(Inline));
        let driver = TransactionDriver::new(s.ctx.clone());
        let (op, _reply, _) = operation();
        let origin = DriverOrigin::Follower {
            op_id: OpId::UNSET,
            hybrid_time: HybridTime::from_micros(1),
        };
        assert!(driver.init(op, origin).is_err());
        assert_eq!(s.tracker.pending_count(), 0);
    }

    #[test]
    fn rejected_apply_fails_operation() {
        let s = setup(Arc::new(Rejecting));
        let driver = TransactionDriver::new(s.ctx.clone());
        let (op, reply, finished) = operation();
        driver.init(op, DriverOrigin::Leader).unwrap();
        driver.execute_async().unwrap();
        s.consensus.commit_all();

        let err = reply.wait().unwrap_err();
        assert!(matches!(err, DriverError::ApplyRejected { .. }));
        assert_eq!(*finished.lock(), vec![OperationResult::Aborted]);
        assert!(s.log.records().is_empty());
        assert_eq!(s.ctx.stats.apply_rejections(), 1);
        assert_eq!(s.tracker.pending_count(), 0);
    }

    #[test]
    fn display_and_prefix() {
        let s = setup(Arc::new(Inline));
        let driver = TransactionDriver::new(s.ctx.clone());
        assert!(driver.to_string().contains("UNINIT"));
        let (op, _reply, _) = operation();
        driver.init(op, DriverOrigin::Leader).unwrap();
        let shown = driver.to_string();
        assert!(shown.starts_with(&driver.id().to_string()));
        assert!(shown.ends_with("[NR-NP] WRITE"));
        assert_eq!(driver.log_prefix(), "T tablet-0 P peer-0 S NR-NP: ");
    }

    #[test]
    #[should_panic(expected = "unrecoverable failure")]
    fn failure_while_replicating_is_fatal() {
        let s = setup(Arc::new(Inline));
        let driver = TransactionDriver::new(s.ctx.clone());
        let (op, _reply, _) = operation();
        driver.init(op, DriverOrigin::Leader).unwrap();
        driver.execute_async().unwrap();
        driver.handle_failure(DriverError::apply_failed("disk"));
    }
}
