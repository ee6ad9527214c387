//! Replication port consumed by the driver.
//!
//! The driver does not implement consensus. It hands [`ReplicationRound`]s to
//! a [`ReplicationPort`] and receives the outcome through the round's
//! callbacks:
//!
//! - `replicate_batch` returns `Err` only if none of the rounds were sent;
//!   the caller then fails every driver in the batch.
//! - For each accepted round the port calls
//!   [`ReplicationRound::bind_to_op_id`] when it appends the round locally, and
//!   exactly once [`ReplicationRound::notify_replication_finished`].
//! - Outcomes are reported in op id order.
//!
//! [`LocalConsensus`] is a single-node implementation for tests and
//! simulation.

mod local;
mod round;

pub use local::{CommitMode, LocalConsensus};
pub use round::{AppendCallback, ReplicateMsg, ReplicationCallback, ReplicationRound};

use crate::error::DriverResult;

/// Accepts rounds for replication.
pub trait ReplicationPort: Send + Sync {
    /// Submits rounds for replication, preserving their order.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be submitted at all.
    fn replicate_batch(&self, rounds: Vec<ReplicationRound>) -> DriverResult<()>;
}
