//! The unit of work a driver executes.
//!
//! An [`Operation`] is supplied by the caller and owned exclusively by one
//! driver. The driver calls its hooks in a fixed order:
//!
//! ```text
//! prepare -> start -> (replication) -> apply -> finish(Committed)
//!        \-> finish(Aborted) on any failure before replication committed
//! ```
//!
//! The driver never interprets what the hooks do to storage.

use crate::error::{DriverError, DriverResult};
use crate::types::{CommitSummary, ConsistencyMode, HybridTime, OpId, OperationResult, OperationType};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

/// Reply channel invoked exactly once with the operation's terminal status.
pub type Completion = Box<dyn FnOnce(DriverResult<CommitSummary>) + Send + 'static>;

/// A polymorphic unit of work driven by a [`TransactionDriver`].
///
/// [`TransactionDriver`]: crate::TransactionDriver
pub trait Operation: Send {
    /// Returns the kind of operation.
    fn op_type(&self) -> OperationType;

    /// Returns the consistency mode the client requested.
    fn consistency_mode(&self) -> ConsistencyMode {
        ConsistencyMode::ClientPropagated
    }

    /// Validates the operation and acquires whatever it needs (e.g. row locks).
    fn prepare(&mut self) -> DriverResult<()>;

    /// Starts the operation at the given hybrid time.
    fn start(&mut self, hybrid_time: HybridTime) -> DriverResult<()>;

    /// Returns the payload to replicate.
    fn replicate_payload(&self) -> Vec<u8>;

    /// Applies the operation to in-memory state. Changes must not be visible
    /// to readers until [`Operation::finish`] is called with `Committed`.
    ///
    /// Returns the result payload stored in the commit record.
    fn apply(&mut self, op_id: OpId) -> DriverResult<Vec<u8>>;

    /// Ends the operation: `Committed` makes applied changes visible,
    /// `Aborted` releases anything acquired during prepare.
    fn finish(&mut self, result: OperationResult);

    /// Takes the reply channel, if the operation has one. The driver takes it
    /// once, when the operation is bound.
    fn take_completion(&mut self) -> Option<Completion> {
        None
    }

    /// Short human-readable description.
    fn describe(&self) -> String {
        self.op_type().to_string()
    }
}

/// Receiving end of a completion created by [`completion_channel`].
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: Receiver<DriverResult<CommitSummary>>,
}

impl CompletionReceiver {
    /// Blocks until the reply arrives.
    ///
    /// # Errors
    ///
    /// Returns the operation's failure status, or `IllegalState` if the
    /// completion was dropped without being invoked.
    pub fn wait(self) -> DriverResult<CommitSummary> {
        self.rx
            .recv()
            .map_err(|_| DriverError::illegal_state("completion dropped without a reply"))?
    }

    /// Blocks until the reply arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DriverResult<CommitSummary>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(DriverError::illegal_state(
                "completion dropped without a reply",
            ))),
        }
    }

    /// Returns the reply if it already arrived.
    pub fn try_recv(&self) -> Option<DriverResult<CommitSummary>> {
        self.rx.try_recv().ok()
    }
}

/// Creates a completion and the receiver observing it.
pub fn completion_channel() -> (Completion, CompletionReceiver) {
    let (tx, rx) = mpsc::channel();
    let completion: Completion = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (completion, CompletionReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_delivers_result() {
        let (completion, rx) = completion_channel();
        completion(Ok(CommitSummary {
            op_id: OpId::new(1, 1),
            hybrid_time: HybridTime::from_micros(10),
        }));
        let summary = rx.wait().unwrap();
        assert_eq!(summary.op_id, OpId::new(1, 1));
    }

    #[test]
    fn dropped_completion_is_an_error() {
        let (completion, rx) = completion_channel();
        drop(completion);
        assert!(matches!(rx.wait(), Err(DriverError::IllegalState { .. })));
    }

    #[test]
    fn wait_timeout_without_reply() {
        let (_completion, rx) = completion_channel();
        assert!(rx.wait_timeout(Duration::from_millis(5)).is_none());
        assert!(rx.try_recv().is_none());
    }
}
