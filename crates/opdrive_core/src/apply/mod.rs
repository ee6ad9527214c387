//! Apply executor consumed by the driver.
//!
//! Apply tasks run off the replication and prepare threads so those never
//! block on storage work. Tasks submitted by one caller run in submission
//! order relative to each other only as far as the pool's FIFO queue goes;
//! there is no ordering across workers beyond that.

mod pool;

pub use pool::ApplyPool;

use crate::error::DriverResult;

/// A unit of apply work.
pub type ApplyTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs apply tasks.
pub trait ApplyExecutor: Send + Sync {
    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task was not queued; it will never run.
    fn submit(&self, task: ApplyTask) -> DriverResult<()>;
}
