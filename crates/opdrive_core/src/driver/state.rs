//! The driver's transition table.
//!
//! [`StateMachine`] is a plain value: it decides what the driver does next
//! but performs no side effects. The driver holds it under its state lock, so
//! every decision below is made atomically with the transition it reports.

use crate::error::{DriverError, DriverResult};
use crate::types::{HybridTime, OpId};
use std::fmt;

/// Progress of replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Leader side, before the round was handed to the replication port.
    NotReplicating,
    /// The round is with the replication port; outcome unknown.
    Replicating,
    /// The round was never sent, or replication reported failure.
    ReplicationFailed,
    /// Replication committed the round.
    Replicated,
}

impl ReplicationState {
    /// Returns true if `next` is a legal successor of `self`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotReplicating, Self::Replicating)
                | (Self::Replicating, Self::Replicated)
                | (Self::Replicating, Self::ReplicationFailed)
        )
    }

    /// Position in the forward order; terminal states share the last rank.
    pub const fn rank(self) -> u8 {
        match self {
            Self::NotReplicating => 0,
            Self::Replicating => 1,
            Self::ReplicationFailed | Self::Replicated => 2,
        }
    }

    const fn short(self) -> &'static str {
        match self {
            Self::NotReplicating => "NR",
            Self::Replicating => "R",
            Self::ReplicationFailed => "RF",
            Self::Replicated => "RD",
        }
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotReplicating => "NOT_REPLICATING",
            Self::Replicating => "REPLICATING",
            Self::ReplicationFailed => "REPLICATION_FAILED",
            Self::Replicated => "REPLICATED",
        };
        f.write_str(name)
    }
}

/// Progress of prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    /// Prepare has not completed.
    NotPrepared,
    /// Prepare and start hooks succeeded.
    Prepared,
}

impl PrepareState {
    /// Returns true if `next` is a legal successor of `self`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!((self, next), (Self::NotPrepared, Self::Prepared))
    }

    const fn short(self) -> &'static str {
        match self {
            Self::NotPrepared => "NP",
            Self::Prepared => "P",
        }
    }
}

impl fmt::Display for PrepareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotPrepared => "NOT_PREPARED",
            Self::Prepared => "PREPARED",
        })
    }
}

/// Why a driver exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOrigin {
    /// This node originates the operation and will replicate it.
    Leader,
    /// Replication of the operation is already underway; the leader assigned
    /// its op id and hybrid time.
    Follower {
        /// Op id assigned by the leader.
        op_id: OpId,
        /// Hybrid time assigned by the leader.
        hybrid_time: HybridTime,
    },
}

impl DriverOrigin {
    /// Returns the replication state a driver of this origin starts in.
    pub const fn initial_replication_state(self) -> ReplicationState {
        match self {
            Self::Leader => ReplicationState::NotReplicating,
            Self::Follower { .. } => ReplicationState::Replicating,
        }
    }

    /// Returns true for [`DriverOrigin::Leader`].
    pub const fn is_leader(self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// How a driver ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The commit record is durable and results are visible.
    Finalized,
    /// The operation was failed back to its caller.
    Failed,
}

/// What to do after prepare succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareAction {
    /// Hand a replication round to the port. The state is already
    /// `Replicating`.
    SubmitReplication,
    /// Replication has not reported yet; it will schedule apply.
    AwaitReplication,
    /// Replication already committed; schedule apply now.
    Apply,
    /// Replication already failed.
    Fail(DriverError),
}

/// What to do after replication reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationAction {
    /// Prepare already completed; schedule apply now.
    Apply,
    /// Prepare has not completed; it will schedule apply.
    AwaitPrepare,
    /// Replication failed.
    Fail(DriverError),
}

/// What to do with an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortAction {
    /// Nothing was sent anywhere; fail the operation now.
    FailNow,
    /// The round is in flight; the abort suppresses the success reply.
    Deferred,
    /// Too late or already finished.
    Ignored,
}

/// What to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Reply with the failure and release the driver.
    Release,
    /// The operation may be part of the replicated history.
    Fatal,
    /// An outcome was already reached.
    AlreadyTerminal,
}

/// Replication × prepare state of one driver, plus the bookkeeping that makes
/// apply and the terminal outcome happen at most once.
#[derive(Debug, Clone)]
pub struct StateMachine {
    origin: DriverOrigin,
    replication: ReplicationState,
    prepare: PrepareState,
    submitted: bool,
    apply_scheduled: bool,
    aborted: bool,
    status: Option<DriverError>,
    outcome: Option<Outcome>,
}

impl StateMachine {
    /// Creates the initial state for a driver of the given origin.
    pub const fn new(origin: DriverOrigin) -> Self {
        Self {
            origin,
            replication: origin.initial_replication_state(),
            prepare: PrepareState::NotPrepared,
            submitted: false,
            apply_scheduled: false,
            aborted: false,
            status: None,
            outcome: None,
        }
    }

    /// Returns the origin.
    pub const fn origin(&self) -> DriverOrigin {
        self.origin
    }

    /// Returns the replication state.
    pub const fn replication(&self) -> ReplicationState {
        self.replication
    }

    /// Returns the prepare state.
    pub const fn prepare(&self) -> PrepareState {
        self.prepare
    }

    /// Returns true once the driver was handed to the prepare scheduler.
    pub const fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Returns true once apply was scheduled.
    pub const fn apply_scheduled(&self) -> bool {
        self.apply_scheduled
    }

    /// Returns true once an abort was recorded.
    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Returns the first failure status recorded.
    pub fn status(&self) -> Option<&DriverError> {
        self.status.as_ref()
    }

    /// Returns the terminal outcome, if reached.
    pub const fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Returns true once an outcome was reached.
    pub const fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Returns true while this node is still the one to replicate.
    pub const fn is_leader_side(&self) -> bool {
        matches!(self.replication, ReplicationState::NotReplicating)
    }

    /// Short form such as `R-NP`.
    pub fn state_string(&self) -> String {
        format!("{}-{}", self.replication.short(), self.prepare.short())
    }

    fn record_status(&mut self, status: DriverError) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    fn terminal_error(&self) -> DriverError {
        self.status
            .clone()
            .unwrap_or_else(|| DriverError::illegal_state("driver already completed"))
    }

    fn advance_replication(&mut self, next: ReplicationState) -> DriverResult<()> {
        if !self.replication.can_advance_to(next) {
            return Err(DriverError::invalid_transition(self.replication, next));
        }
        self.replication = next;
        Ok(())
    }

    fn schedule_apply(&mut self) -> DriverResult<()> {
        if self.apply_scheduled {
            return Err(DriverError::illegal_state("apply already scheduled"));
        }
        self.apply_scheduled = true;
        Ok(())
    }

    /// Marks the driver as handed to the prepare scheduler. Succeeds once.
    ///
    /// # Errors
    ///
    /// Fails if the driver already completed, was already submitted or was
    /// already prepared.
    pub fn begin_submit(&mut self) -> DriverResult<()> {
        self.begin_prepare()?;
        if self.submitted {
            return Err(DriverError::illegal_state("operation already submitted"));
        }
        self.submitted = true;
        Ok(())
    }

    /// Checks that prepare may start.
    ///
    /// # Errors
    ///
    /// Fails if the driver already completed or was already prepared.
    pub fn begin_prepare(&self) -> DriverResult<()> {
        if self.is_terminal() {
            return Err(self.terminal_error());
        }
        if self.prepare == PrepareState::Prepared {
            return Err(DriverError::illegal_state("operation already prepared"));
        }
        Ok(())
    }

    /// Records that prepare succeeded.
    ///
    /// # Errors
    ///
    /// Fails if the driver completed while prepare ran, or prepare already
    /// completed.
    pub fn on_prepared(&mut self) -> DriverResult<PrepareAction> {
        self.begin_prepare()?;
        if self.replication == ReplicationState::NotReplicating && !self.origin.is_leader() {
            return Err(DriverError::illegal_state("follower driver is not replicating"));
        }
        self.prepare = PrepareState::Prepared;
        let action = match self.replication {
            ReplicationState::NotReplicating => {
                self.advance_replication(ReplicationState::Replicating)?;
                PrepareAction::SubmitReplication
            }
            ReplicationState::Replicating => PrepareAction::AwaitReplication,
            ReplicationState::Replicated => {
                self.schedule_apply()?;
                PrepareAction::Apply
            }
            ReplicationState::ReplicationFailed => PrepareAction::Fail(self.terminal_error()),
        };
        Ok(action)
    }

    /// Records that the round could not be handed to the replication port.
    ///
    /// # Errors
    ///
    /// Fails unless the round was being handed off.
    pub fn on_replication_submit_failed(&mut self, status: DriverError) -> DriverResult<()> {
        self.advance_replication(ReplicationState::ReplicationFailed)?;
        self.record_status(status);
        Ok(())
    }

    /// Records the replication outcome.
    ///
    /// # Errors
    ///
    /// Fails unless replication was in flight.
    pub fn on_replication_finished(&mut self, status: DriverResult<()>) -> DriverResult<ReplicationAction> {
        match status {
            Ok(()) => {
                self.advance_replication(ReplicationState::Replicated)?;
                if self.prepare == PrepareState::Prepared {
                    self.schedule_apply()?;
                    Ok(ReplicationAction::Apply)
                } else {
                    Ok(ReplicationAction::AwaitPrepare)
                }
            }
            Err(status) => {
                self.advance_replication(ReplicationState::ReplicationFailed)?;
                self.record_status(status);
                Ok(ReplicationAction::Fail(self.terminal_error()))
            }
        }
    }

    /// Records an abort request.
    pub fn on_abort(&mut self, status: DriverError) -> AbortAction {
        if self.is_terminal() {
            return AbortAction::Ignored;
        }
        match self.replication {
            ReplicationState::NotReplicating => {
                self.aborted = true;
                self.record_status(status);
                AbortAction::FailNow
            }
            ReplicationState::Replicating => {
                self.aborted = true;
                self.record_status(status);
                AbortAction::Deferred
            }
            ReplicationState::ReplicationFailed | ReplicationState::Replicated => AbortAction::Ignored,
        }
    }

    /// Records a failure and decides whether it can be reported.
    pub fn on_failure(&mut self, status: DriverError) -> FailureAction {
        if self.is_terminal() {
            return FailureAction::AlreadyTerminal;
        }
        self.record_status(status);
        match self.replication {
            ReplicationState::NotReplicating | ReplicationState::ReplicationFailed => {
                self.outcome = Some(Outcome::Failed);
                FailureAction::Release
            }
            ReplicationState::Replicating | ReplicationState::Replicated => FailureAction::Fatal,
        }
    }

    /// Records that the apply task could not be queued. Returns false if the
    /// driver already completed.
    pub fn on_apply_rejected(&mut self, status: DriverError) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.record_status(status);
        self.outcome = Some(Outcome::Failed);
        true
    }

    /// Records that the commit record is durable. Returns the abort status to
    /// reply with instead of success, if an abort was recorded while the round
    /// was in flight.
    ///
    /// # Errors
    ///
    /// Fails unless apply was scheduled and the driver has not completed.
    pub fn on_finalized(&mut self) -> DriverResult<Option<DriverError>> {
        if self.is_terminal() {
            return Err(DriverError::illegal_state("driver already completed"));
        }
        if !self.apply_scheduled {
            return Err(DriverError::illegal_state("finalize before apply was scheduled"));
        }
        self.outcome = Some(Outcome::Finalized);
        Ok(if self.aborted { self.status.clone() } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn follower() -> DriverOrigin {
        DriverOrigin::Follower {
            op_id: OpId::new(1, 7),
            hybrid_time: HybridTime::from_micros(100),
        }
    }

    #[test]
    fn initial_states() {
        let leader = StateMachine::new(DriverOrigin::Leader);
        assert_eq!(leader.replication(), ReplicationState::NotReplicating);
        assert!(leader.is_leader_side());
        assert_eq!(leader.state_string(), "NR-NP");

        let follower = StateMachine::new(follower());
        assert_eq!(follower.replication(), ReplicationState::Replicating);
        assert!(!follower.is_leader_side());
        assert_eq!(follower.state_string(), "R-NP");
    }

    #[test]
    fn leader_prepare_hands_off_replication() {
        let mut sm = StateMachine::new(DriverOrigin::Leader);
        assert_eq!(sm.on_prepared().unwrap(), PrepareAction::SubmitReplication);
        assert_eq!(sm.replication(), ReplicationState::Replicating);
        assert_eq!(sm.on_replication_finished(Ok(())).unwrap(), ReplicationAction::Apply);
        assert!(sm.apply_scheduled());
        assert_eq!(sm.on_finalized().unwrap(), None);
        assert_eq!(sm.outcome(), Some(Outcome::Finalized));
        assert_eq!(sm.state_string(), "RD-P");
    }

    #[test]
    fn follower_replicated_before_prepare() {
        let mut sm = StateMachine::new(follower());
        assert_eq!(
            sm.on_replication_finished(Ok(())).unwrap(),
            ReplicationAction::AwaitPrepare
        );
        assert!(!sm.apply_scheduled());
        assert_eq!(sm.on_prepared().unwrap(), PrepareAction::Apply);
        assert!(sm.apply_scheduled());
    }

    #[test]
    fn follower_prepared_before_replication() {
        let mut sm = StateMachine::new(follower());
        assert_eq!(sm.on_prepared().unwrap(), PrepareAction::AwaitReplication);
        assert_eq!(sm.on_replication_finished(Ok(())).unwrap(), ReplicationAction::Apply);
    }

    #[test]
    fn submit_failure_then_release() {
        let mut sm = StateMachine::new(DriverOrigin::Leader);
        sm.on_prepared().unwrap();
        let err = DriverError::replication_rejected("queue full");
        sm.on_replication_submit_failed(err.clone()).unwrap();
        assert_eq!(sm.on_failure(err.clone()), FailureAction::Release);
        assert_eq!(sm.status(), Some(&err));
        assert_eq!(sm.on_failure(err), FailureAction::AlreadyTerminal);
    }

    #[test]
    fn submit_failure_requires_hand_off() {
        let mut sm = StateMachine::new(DriverOrigin::Leader);
        let err = sm
            .on_replication_submit_failed(DriverError::replication_rejected("x"))
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidStateTransition { .. }));
    }

    #[test]
    fn replication_reported_twice_is_rejected() {
        let mut sm = StateMachine::new(follower());
        sm.on_replication_finished(Ok(())).unwrap();
        assert!(sm.on_replication_finished(Ok(())).is_err());
        assert!(sm
            .on_replication_finished(Err(DriverError::replication_failed("late")))
            .is_err());
        assert_eq!(sm.replication(), ReplicationState::Replicated);
    }

    #[test]
    fn submit_is_accepted_once() {
        let mut sm = StateMachine::new(DriverOrigin::Leader);
        sm.begin_submit().unwrap();
        assert!(sm.is_submitted());
        let err = sm.begin_submit().unwrap_err();
        assert!(matches!(err, DriverError::IllegalState { .. }));

        let mut sm = StateMachine::new(follower());
        sm.on_prepared().unwrap();
        assert!(sm.begin_submit().is_err());
        assert!(!sm.is_submitted());

        let mut sm = StateMachine::new(DriverOrigin::Leader);
        sm.on_abort(DriverError::aborted("gone"));
        sm.on_failure(DriverError::aborted("gone"));
        let err = sm.begin_submit().unwrap_err();
        assert_eq!(err.abort_reason(), Some("gone"));
    }

    #[test]
    fn abort_before_anything_fails_now() {
        let mut sm = StateMachine::new(DriverOrigin::Leader);
        assert_eq!(sm.on_abort(DriverError::aborted("user")), AbortAction::FailNow);
        assert_eq!(sm.on_failure(DriverError::aborted("user")), FailureAction::Release);
        let err = sm.on_prepared().unwrap_err();
        assert_eq!(err.abort_reason(), Some("user"));
        assert!(!sm.apply_scheduled());
    }

    #[test]
    fn abort_in_flight_suppresses_success() {
        let mut sm = StateMachine::new(DriverOrigin::Leader);
        sm.on_prepared().unwrap();
        assert_eq!(sm.on_abort(DriverError::aborted("late")), AbortAction::Deferred);
        assert_eq!(sm.on_replication_finished(Ok(())).unwrap(), ReplicationAction::Apply);
        let reply = sm.on_finalized().unwrap();
        assert_eq!(reply.and_then(|e| e.abort_reason().map(str::to_owned)), Some("late".into()));
    }

    #[test]
    fn abort_after_replication_is_ignored() {
        let mut sm = StateMachine::new(follower());
        sm.on_replication_finished(Ok(())).unwrap();
        assert_eq!(sm.on_abort(DriverError::aborted("x")), AbortAction::Ignored);
        sm.on_prepared().unwrap();
        assert_eq!(sm.on_finalized().unwrap(), None);
    }

    #[test]
    fn failure_in_flight_is_fatal() {
        let mut sm = StateMachine::new(follower());
        assert_eq!(sm.on_failure(DriverError::prepare_failed("bad")), FailureAction::Fatal);
        let mut sm = StateMachine::new(follower());
        sm.on_replication_finished(Ok(())).unwrap();
        assert_eq!(sm.on_failure(DriverError::apply_failed("bad")), FailureAction::Fatal);
    }

    #[test]
    fn apply_rejection_is_terminal() {
        let mut sm = StateMachine::new(follower());
        sm.on_prepared().unwrap();
        sm.on_replication_finished(Ok(())).unwrap();
        assert!(sm.on_apply_rejected(DriverError::apply_rejected("full")));
        assert_eq!(sm.outcome(), Some(Outcome::Failed));
        assert!(sm.on_finalized().is_err());
        assert!(!sm.on_apply_rejected(DriverError::apply_rejected("again")));
    }

    #[derive(Debug, Clone)]
    enum Event {
        Prepared,
        PrepareFailed,
        SubmitFailed,
        ReplicationOk,
        ReplicationErr,
        Abort,
        Finalize,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            3 => Just(Event::Prepared),
            1 => Just(Event::PrepareFailed),
            1 => Just(Event::SubmitFailed),
            3 => Just(Event::ReplicationOk),
            1 => Just(Event::ReplicationErr),
            1 => Just(Event::Abort),
            2 => Just(Event::Finalize),
        ]
    }

    fn origin() -> impl Strategy<Value = DriverOrigin> {
        prop_oneof![Just(DriverOrigin::Leader), Just(follower())]
    }

    proptest! {
        #[test]
        fn transitions_are_monotonic_and_apply_happens_once(
            origin in origin(),
            events in proptest::collection::vec(event(), 0..24),
        ) {
            let mut sm = StateMachine::new(origin);
            let mut applies = 0;
            let mut outcomes = 0;

            for event in events {
                let before = sm.clone();
                let mut fatal = false;
                match event {
                    Event::Prepared => match sm.on_prepared() {
                        Ok(PrepareAction::Apply) => applies += 1,
                        Ok(PrepareAction::Fail(e)) => fatal |= sm.on_failure(e) == FailureAction::Fatal,
                        _ => {}
                    },
                    Event::PrepareFailed => {
                        if sm.begin_prepare().is_ok() {
                            fatal = sm.on_failure(DriverError::prepare_failed("x")) == FailureAction::Fatal;
                        }
                    }
                    Event::SubmitFailed => {
                        let e = DriverError::replication_rejected("x");
                        if sm.on_replication_submit_failed(e.clone()).is_ok() {
                            fatal = sm.on_failure(e) == FailureAction::Fatal;
                        }
                    }
                    Event::ReplicationOk => {
                        if let Ok(ReplicationAction::Apply) = sm.on_replication_finished(Ok(())) {
                            applies += 1;
                        }
                    }
                    Event::ReplicationErr => {
                        if let Ok(ReplicationAction::Fail(e)) =
                            sm.on_replication_finished(Err(DriverError::replication_failed("x")))
                        {
                            fatal = sm.on_failure(e) == FailureAction::Fatal;
                        }
                    }
                    Event::Abort => {
                        if sm.on_abort(DriverError::aborted("x")) == AbortAction::FailNow {
                            fatal = sm.on_failure(DriverError::aborted("x")) == FailureAction::Fatal;
                        }
                    }
                    Event::Finalize => {
                        if sm.on_finalized().is_ok() {
                            prop_assert_eq!(sm.replication(), ReplicationState::Replicated);
                        }
                    }
                }

                prop_assert!(sm.replication().rank() >= before.replication().rank());
                prop_assert!(
                    sm.replication() == before.replication()
                        || before.replication().can_advance_to(sm.replication())
                );
                prop_assert!(sm.prepare() == before.prepare() || before.prepare().can_advance_to(sm.prepare()));
                if before.is_terminal() {
                    prop_assert_eq!(before.outcome(), sm.outcome());
                } else if sm.is_terminal() {
                    outcomes += 1;
                }
                if sm.apply_scheduled() {
                    prop_assert_eq!(sm.prepare(), PrepareState::Prepared);
                    prop_assert_eq!(sm.replication(), ReplicationState::Replicated);
                }
                if fatal {
                    // The process would have stopped here.
                    break;
                }
            }

            prop_assert!(applies <= 1);
            prop_assert!(outcomes <= 1);
            prop_assert_eq!(applies == 1, sm.apply_scheduled());
        }
    }
}
