//! Registry of live drivers.

use crate::config::TrackerConfig;
use crate::driver::TransactionDriver;
use crate::error::{DriverError, DriverResult};
use crate::types::DriverId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tracks drivers from `init` until they finalize or fail.
pub trait DriverRegistry: Send + Sync {
    /// Registers a driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver may not be admitted.
    fn add(&self, driver: &Arc<TransactionDriver>) -> DriverResult<()>;

    /// Marks a driver as complete and drops the registry's reference.
    fn release(&self, driver: &TransactionDriver);
}

/// The default registry.
///
/// Holds a strong reference to each live driver, which keeps the driver alive
/// while work is outstanding. Admission is bounded by
/// [`TrackerConfig::max_pending`].
///
/// A driver reaches the tracker through its [`DriverContext`], so the two keep
/// each other alive until [`DriverRegistry::release`] drops the entry.
///
/// [`DriverContext`]: crate::driver::DriverContext
pub struct TransactionTracker {
    config: TrackerConfig,
    pending: Mutex<HashMap<DriverId, Arc<TransactionDriver>>>,
    drained: Condvar,
}

impl TransactionTracker {
    /// Creates an empty tracker.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
        }
    }

    /// Returns the number of live drivers.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns the live drivers, oldest first.
    pub fn pending_drivers(&self) -> Vec<Arc<TransactionDriver>> {
        let mut drivers: Vec<_> = self.pending.lock().values().cloned().collect();
        drivers.sort_by_key(|d| d.id());
        drivers
    }

    /// Describes every live driver, oldest first.
    pub fn dump(&self) -> Vec<String> {
        // Formatting takes each driver's state lock; do it outside ours.
        self.pending_drivers().iter().map(|d| d.to_string()).collect()
    }

    /// Blocks until no drivers are live.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` if drivers are still live after `timeout`.
    pub fn wait_for_all_to_finish(&self, timeout: Duration) -> DriverResult<()> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while !pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::timed_out(format!(
                    "{} drivers still pending",
                    pending.len()
                )));
            }
            let step = (deadline - now).min(Duration::from_secs(1));
            if self.drained.wait_for(&mut pending, step).timed_out() && !pending.is_empty() {
                tracing::warn!(pending = pending.len(), "waiting for drivers to finish");
            }
        }
        Ok(())
    }
}

impl DriverRegistry for TransactionTracker {
    fn add(&self, driver: &Arc<TransactionDriver>) -> DriverResult<()> {
        let mut pending = self.pending.lock();
        if let Some(max) = self.config.max_pending {
            if pending.len() >= max {
                return Err(DriverError::service_unavailable(format!(
                    "{} drivers pending, limit is {max}",
                    pending.len()
                )));
            }
        }
        if pending.insert(driver.id(), Arc::clone(driver)).is_some() {
            tracing::warn!(driver = %driver.id(), "driver registered twice");
        }
        Ok(())
    }

    fn release(&self, driver: &TransactionDriver) {
        let removed = {
            let mut pending = self.pending.lock();
            let removed = pending.remove(&driver.id());
            if pending.is_empty() {
                self.drained.notify_all();
            }
            removed
        };
        if removed.is_none() {
            tracing::warn!(driver = %driver.id(), "released a driver that was not registered");
        }
        // `removed` may hold the last reference; it is dropped here, after
        // the tracker lock was released.
    }
}

impl std::fmt::Debug for TransactionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTracker")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}
