//! Prepare scheduling.
//!
//! A [`PrepareScheduler`] runs [`TransactionDriver::prepare_and_start`] for
//! submitted drivers. Leader-side drivers produce a replication round that the
//! scheduler must hand to the replication port, alone or batched with the
//! rounds of neighbouring drivers. Follower drivers are prepared one at a
//! time through [`TransactionDriver::prepare_and_start_task`].

mod thread;

pub use thread::PrepareThread;

use crate::driver::TransactionDriver;
use crate::error::DriverResult;
use std::sync::Arc;

/// Accepts drivers for prepare.
pub trait PrepareScheduler: Send + Sync {
    /// Queues a driver. Must not block.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver was not queued.
    fn submit(&self, driver: Arc<TransactionDriver>) -> DriverResult<()>;
}
