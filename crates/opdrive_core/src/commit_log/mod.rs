//! Durability log consumed by the driver.
//!
//! After an operation is applied, the driver appends a [`CommitRecord`] and
//! only finalizes once the log reports it durable. The record's on-disk shape
//! belongs to the log implementation.

mod memory;

pub use memory::{LogSyncMode, MemoryLog};

use crate::error::DriverResult;
use crate::types::{HybridTime, OpId, OperationType};

/// Invoked exactly once when a commit record is durable or failed to persist.
pub type LogCallback = Box<dyn FnOnce(DriverResult<()>) + Send + 'static>;

/// The outcome of applying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Op id of the committed operation.
    pub op_id: OpId,
    /// Kind of the operation.
    pub op_type: OperationType,
    /// Hybrid time the operation was assigned.
    pub hybrid_time: HybridTime,
    /// Result payload returned by the apply hook.
    pub result: Vec<u8>,
}

/// Accepts commit records.
pub trait DurabilityLog: Send + Sync {
    /// Appends a commit record. `on_durable` is called exactly once if the
    /// record was accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the record was not accepted; `on_durable` is then
    /// never called.
    fn append_commit(&self, record: CommitRecord, on_durable: LogCallback) -> DriverResult<()>;
}
