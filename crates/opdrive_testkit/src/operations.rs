//! Scriptable operations.
//!
//! [`TestOperation`] records every hook the driver calls into a shared
//! [`OpRecorder`], and can be told to fail or stall in prepare or apply.

use opdrive_core::{
    completion_channel, Completion, CompletionReceiver, ConsistencyMode, DriverError, DriverResult,
    HybridTime, OpId, Operation, OperationResult, OperationType,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A hook call observed by an [`OpRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpEvent {
    /// `prepare` ran.
    Prepared,
    /// `start` ran at the given hybrid time.
    Started(HybridTime),
    /// `apply` ran at the given op id.
    Applied(OpId),
    /// `finish` ran.
    Finished(OperationResult),
}

#[derive(Debug, Default)]
struct RecorderState {
    events: Vec<OpEvent>,
    staged: bool,
    visible: bool,
}

/// Shared view of what a [`TestOperation`] went through.
///
/// Apply stages the operation's effect; only `finish(Committed)` makes it
/// visible, mirroring how a real operation would hold back its writes.
#[derive(Debug, Default)]
pub struct OpRecorder {
    state: Mutex<RecorderState>,
}

impl OpRecorder {
    /// Returns every hook call, in order.
    pub fn events(&self) -> Vec<OpEvent> {
        self.state.lock().events.clone()
    }

    /// Returns how many times `apply` ran.
    pub fn apply_count(&self) -> usize {
        self.count(|e| matches!(e, OpEvent::Applied(_)))
    }

    /// Returns how many times `prepare` ran.
    pub fn prepare_count(&self) -> usize {
        self.count(|e| matches!(e, OpEvent::Prepared))
    }

    /// Returns every `finish` result, in order.
    pub fn finish_results(&self) -> Vec<OperationResult> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                OpEvent::Finished(result) => Some(*result),
                _ => None,
            })
            .collect()
    }

    /// Returns the op id `apply` ran at.
    pub fn applied_at(&self) -> Option<OpId> {
        self.state.lock().events.iter().find_map(|e| match e {
            OpEvent::Applied(op_id) => Some(*op_id),
            _ => None,
        })
    }

    /// Returns the hybrid time `start` ran at.
    pub fn started_at(&self) -> Option<HybridTime> {
        self.state.lock().events.iter().find_map(|e| match e {
            OpEvent::Started(ht) => Some(*ht),
            _ => None,
        })
    }

    /// Returns true once the applied effect was made visible.
    pub fn is_visible(&self) -> bool {
        self.state.lock().visible
    }

    /// Returns true while an applied effect is neither visible nor discarded.
    pub fn has_staged_effect(&self) -> bool {
        self.state.lock().staged
    }

    fn count(&self, f: impl Fn(&OpEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| f(e)).count()
    }

    fn record(&self, event: OpEvent) {
        let mut state = self.state.lock();
        match &event {
            OpEvent::Applied(_) => state.staged = true,
            OpEvent::Finished(OperationResult::Committed) => {
                state.visible = state.staged;
                state.staged = false;
            }
            OpEvent::Finished(OperationResult::Aborted) => state.staged = false,
            _ => {}
        }
        state.events.push(event);
    }
}

/// An operation whose hooks are scripted by the test.
pub struct TestOperation {
    op_type: OperationType,
    consistency: ConsistencyMode,
    payload: Vec<u8>,
    fail_prepare: Option<DriverError>,
    fail_apply: Option<DriverError>,
    prepare_delay: Duration,
    apply_delay: Duration,
    completion: Option<Completion>,
    recorder: Arc<OpRecorder>,
}

impl TestOperation {
    /// Creates a write operation whose hooks all succeed.
    pub fn new() -> Self {
        Self::of_type(OperationType::Write)
    }

    /// Creates an operation of the given kind whose hooks all succeed.
    pub fn of_type(op_type: OperationType) -> Self {
        Self {
            op_type,
            consistency: ConsistencyMode::ClientPropagated,
            payload: Vec::new(),
            fail_prepare: None,
            fail_apply: None,
            prepare_delay: Duration::ZERO,
            apply_delay: Duration::ZERO,
            completion: None,
            recorder: Arc::new(OpRecorder::default()),
        }
    }

    /// Sets the consistency mode.
    #[must_use]
    pub fn consistency(mut self, mode: ConsistencyMode) -> Self {
        self.consistency = mode;
        self
    }

    /// Sets the replicated payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Makes `prepare` fail with `error`.
    #[must_use]
    pub fn fail_prepare(mut self, error: DriverError) -> Self {
        self.fail_prepare = Some(error);
        self
    }

    /// Makes `apply` fail with `error`.
    #[must_use]
    pub fn fail_apply(mut self, error: DriverError) -> Self {
        self.fail_apply = Some(error);
        self
    }

    /// Makes `prepare` sleep first.
    #[must_use]
    pub fn prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    /// Makes `apply` sleep first.
    #[must_use]
    pub fn apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// Attaches a reply channel and returns its receiving end.
    pub fn with_reply(mut self) -> (Self, CompletionReceiver) {
        let (completion, receiver) = completion_channel();
        self.completion = Some(completion);
        (self, receiver)
    }

    /// Returns the recorder shared with this operation.
    pub fn recorder(&self) -> Arc<OpRecorder> {
        Arc::clone(&self.recorder)
    }
}

impl Default for TestOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation for TestOperation {
    fn op_type(&self) -> OperationType {
        self.op_type
    }

    fn consistency_mode(&self) -> ConsistencyMode {
        self.consistency
    }

    fn prepare(&mut self) -> DriverResult<()> {
        if !self.prepare_delay.is_zero() {
            thread::sleep(self.prepare_delay);
        }
        if let Some(error) = self.fail_prepare.take() {
            return Err(error);
        }
        self.recorder.record(OpEvent::Prepared);
        Ok(())
    }

    fn start(&mut self, hybrid_time: HybridTime) -> DriverResult<()> {
        self.recorder.record(OpEvent::Started(hybrid_time));
        Ok(())
    }

    fn replicate_payload(&self) -> Vec<u8> {
        self.payload.clone()
    }

    fn apply(&mut self, op_id: OpId) -> DriverResult<Vec<u8>> {
        if !self.apply_delay.is_zero() {
            thread::sleep(self.apply_delay);
        }
        if let Some(error) = self.fail_apply.take() {
            return Err(error);
        }
        self.recorder.record(OpEvent::Applied(op_id));
        Ok(op_id.index.to_le_bytes().to_vec())
    }

    fn finish(&mut self, result: OperationResult) {
        self.recorder.record(OpEvent::Finished(result));
    }

    fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    fn describe(&self) -> String {
        format!("{} ({} byte payload)", self.op_type, self.payload.len())
    }
}

impl std::fmt::Debug for TestOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestOperation")
            .field("op_type", &self.op_type)
            .field("consistency", &self.consistency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_tracks_visibility() {
        let mut op = TestOperation::new();
        let recorder = op.recorder();
        op.prepare().unwrap();
        op.apply(OpId::new(1, 4)).unwrap();
        assert!(recorder.has_staged_effect());
        assert!(!recorder.is_visible());
        op.finish(OperationResult::Committed);
        assert!(recorder.is_visible());
        assert_eq!(recorder.applied_at(), Some(OpId::new(1, 4)));
    }

    #[test]
    fn aborted_effect_is_discarded() {
        let mut op = TestOperation::new();
        let recorder = op.recorder();
        op.apply(OpId::new(1, 1)).unwrap();
        op.finish(OperationResult::Aborted);
        assert!(!recorder.has_staged_effect());
        assert!(!recorder.is_visible());
    }

    #[test]
    fn scripted_failures() {
        let mut op = TestOperation::new()
            .fail_prepare(DriverError::prepare_failed("locked"))
            .fail_apply(DriverError::apply_failed("corrupt"));
        assert!(op.prepare().is_err());
        assert!(op.apply(OpId::new(1, 1)).is_err());
        assert_eq!(op.recorder().prepare_count(), 0);
        assert_eq!(op.recorder().apply_count(), 0);
    }
}
