//! Verification that replicated operations are applied in replicated order.

use crate::error::{DriverError, DriverResult};
use parking_lot::Mutex;

/// Checks the order in which operations start applying.
pub trait OrderVerifier: Send + Sync {
    /// Called once per operation, in the order apply is scheduled.
    ///
    /// # Errors
    ///
    /// Returns `OrderViolation` if the operation is out of replicated order.
    fn check_apply(&self, op_index: u64, prepare_micros: u64) -> DriverResult<()>;
}

#[derive(Debug, Default)]
struct Last {
    index: u64,
    prepare_micros: u64,
}

/// Requires consecutive op indexes and non-decreasing prepare timestamps.
///
/// The first checked index may be anything, since a node can start applying
/// from any point after bootstrap.
#[derive(Debug, Default)]
pub struct ApplyOrderVerifier {
    last: Mutex<Last>,
}

impl ApplyOrderVerifier {
    /// Creates a verifier that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last index that passed the check, or 0.
    pub fn last_index(&self) -> u64 {
        self.last.lock().index
    }
}

impl OrderVerifier for ApplyOrderVerifier {
    fn check_apply(&self, op_index: u64, prepare_micros: u64) -> DriverResult<()> {
        let mut last = self.last.lock();
        if last.index != 0 {
            if op_index != last.index + 1 {
                return Err(DriverError::order_violation(format!(
                    "applying index {op_index} after index {}",
                    last.index
                )));
            }
            if prepare_micros < last.prepare_micros {
                return Err(DriverError::order_violation(format!(
                    "index {op_index} prepared at {prepare_micros}us, before index {} at {}us",
                    last.index, last.prepare_micros
                )));
            }
        }
        last.index = op_index;
        last.prepare_micros = prepare_micros;
        Ok(())
    }
}
