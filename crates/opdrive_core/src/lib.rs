//! # opdrive core
//!
//! Per-operation transaction driver for a consensus-replicated storage node.
//!
//! A [`TransactionDriver`] owns one [`Operation`] and carries it through
//! prepare, replication, apply and a durable commit record to a visible
//! result. The driver does not implement consensus, storage or scheduling
//! itself; it consumes them through traits:
//!
//! - [`PrepareScheduler`] runs prepare ([`PrepareThread`] batches leader rounds)
//! - [`ReplicationPort`] replicates rounds ([`LocalConsensus`] for one node)
//! - [`ApplyExecutor`] runs apply ([`ApplyPool`])
//! - [`DurabilityLog`] persists commit records ([`MemoryLog`])
//! - [`DriverRegistry`] tracks live drivers ([`TransactionTracker`])
//! - [`OrderVerifier`] checks follower apply order ([`ApplyOrderVerifier`])
//!
//! ## Guarantees
//!
//! - Apply is scheduled exactly once, after both prepare and replication
//!   completed, whichever finishes second.
//! - Replication and prepare states only move forward.
//! - Each operation gets exactly one terminal reply.
//! - A failure after the operation may have been replicated is not reported
//!   as an ordinary error; it is handled per [`FatalPolicy`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let driver = TransactionDriver::new(ctx.clone());
//! driver.init(Box::new(op), DriverOrigin::Leader)?;
//! driver.execute_async()?;
//! let summary = reply.wait()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod clock;
mod commit_log;
mod config;
mod consensus;
mod driver;
mod error;
mod operation;
mod order_verifier;
mod prepare;
mod stats;
mod trace;
mod tracker;
mod types;

pub use apply::{ApplyExecutor, ApplyPool, ApplyTask};
pub use clock::{monotonic_micros, Clock, SystemClock};
pub use commit_log::{CommitRecord, DurabilityLog, LogCallback, LogSyncMode, MemoryLog};
pub use config::{ApplyPoolConfig, DriverConfig, FatalPolicy, PrepareConfig, TrackerConfig};
pub use consensus::{
    AppendCallback, CommitMode, LocalConsensus, ReplicateMsg, ReplicationCallback, ReplicationPort,
    ReplicationRound,
};
pub use driver::state::{
    AbortAction, FailureAction, PrepareAction, ReplicationAction, StateMachine,
};
pub use driver::{
    DriverContext, DriverOrigin, Outcome, PrepareState, ReplicationState, TransactionDriver,
};
pub use error::{DriverError, DriverResult};
pub use operation::{completion_channel, Completion, CompletionReceiver, Operation};
pub use order_verifier::{ApplyOrderVerifier, OrderVerifier};
pub use prepare::{PrepareScheduler, PrepareThread};
pub use stats::{DriverStats, StatsSnapshot};
pub use trace::{Trace, TraceEntry};
pub use tracker::{DriverRegistry, TransactionTracker};
pub use types::{
    CommitSummary, ConsistencyMode, DriverId, HybridTime, OpId, OperationResult, OperationType,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
