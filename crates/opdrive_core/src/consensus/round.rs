//! Replication rounds.

use crate::error::DriverResult;
use crate::types::{HybridTime, OpId, OperationType};
use std::fmt;

/// Invoked when the replication layer appends a round locally.
pub type AppendCallback = Box<dyn FnOnce(OpId) + Send + 'static>;

/// Invoked exactly once when the replication outcome is known.
pub type ReplicationCallback = Box<dyn FnOnce(OpId, DriverResult<()>) + Send + 'static>;

/// The message replicated for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateMsg {
    /// Kind of the operation.
    pub op_type: OperationType,
    /// Hybrid time the leader assigned.
    pub hybrid_time: HybridTime,
    /// Opaque operation payload.
    pub payload: Vec<u8>,
}

/// A replicate message together with the callbacks of the driver that
/// produced it.
///
/// The replication port binds the round to an op id when it appends it, and
/// reports the outcome through [`ReplicationRound::notify_replication_finished`].
/// Both callbacks fire at most once.
pub struct ReplicationRound {
    msg: ReplicateMsg,
    op_id: OpId,
    on_append: Option<AppendCallback>,
    on_finished: Option<ReplicationCallback>,
}

impl ReplicationRound {
    /// Creates a round with explicit callbacks.
    pub fn new(msg: ReplicateMsg, on_append: AppendCallback, on_finished: ReplicationCallback) -> Self {
        Self {
            msg,
            op_id: OpId::UNSET,
            on_append: Some(on_append),
            on_finished: Some(on_finished),
        }
    }

    /// Returns the replicate message.
    pub fn msg(&self) -> &ReplicateMsg {
        &self.msg
    }

    /// Returns the op id, or `OpId::UNSET` if not yet appended.
    pub fn id(&self) -> OpId {
        self.op_id
    }

    /// Binds the round to the op id it was appended at.
    ///
    /// Only the first binding takes effect.
    pub fn bind_to_op_id(&mut self, op_id: OpId) {
        if let Some(on_append) = self.on_append.take() {
            self.op_id = op_id;
            on_append(op_id);
        } else {
            tracing::warn!(bound = %self.op_id, requested = %op_id, "round already bound to an op id");
        }
    }

    /// Reports the replication outcome to the driver.
    ///
    /// Only the first notification takes effect.
    pub fn notify_replication_finished(&mut self, status: DriverResult<()>) {
        if let Some(on_finished) = self.on_finished.take() {
            on_finished(self.op_id, status);
        } else {
            tracing::warn!(op_id = %self.op_id, "replication outcome already reported");
        }
    }

    /// Returns true once the outcome was reported.
    pub fn is_finished(&self) -> bool {
        self.on_finished.is_none()
    }
}

impl fmt::Debug for ReplicationRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationRound")
            .field("op_id", &self.op_id)
            .field("op_type", &self.msg.op_type)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}
