//! Test doubles for the driver's collaborators.
//!
//! The inline doubles run work on the calling thread. The manual doubles
//! queue it until the test releases it, which lets a test choose the exact
//! order in which prepare, replication and apply happen.

use opdrive_core::{
    ApplyExecutor, ApplyTask, Clock, DriverError, DriverResult, HybridTime, OrderVerifier,
    PrepareScheduler, TransactionDriver,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Prepares each driver on the submitting thread.
#[derive(Debug, Default)]
pub struct InlineScheduler;

impl PrepareScheduler for InlineScheduler {
    fn submit(&self, driver: Arc<TransactionDriver>) -> DriverResult<()> {
        driver.prepare_and_start_task();
        Ok(())
    }
}

/// Queues drivers until the test runs them.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Arc<TransactionDriver>>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the oldest queued driver. Returns false if none was queued.
    pub fn run_next(&self) -> bool {
        let next = self.queue.lock().pop_front();
        match next {
            Some(driver) => {
                driver.prepare_and_start_task();
                true
            }
            None => false,
        }
    }

    /// Prepares every queued driver. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        while self.run_next() {
            count += 1;
        }
        count
    }

    /// Returns the number of queued drivers.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl PrepareScheduler for ManualScheduler {
    fn submit(&self, driver: Arc<TransactionDriver>) -> DriverResult<()> {
        self.queue.lock().push_back(driver);
        Ok(())
    }
}

/// Refuses every driver.
#[derive(Debug, Default)]
pub struct RejectingScheduler;

impl PrepareScheduler for RejectingScheduler {
    fn submit(&self, _driver: Arc<TransactionDriver>) -> DriverResult<()> {
        Err(DriverError::service_unavailable("prepare queue is full"))
    }
}

/// Runs each apply task on the submitting thread.
#[derive(Debug, Default)]
pub struct InlineExecutor {
    executed: AtomicUsize,
}

impl InlineExecutor {
    /// Creates an executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many tasks ran.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

impl ApplyExecutor for InlineExecutor {
    fn submit(&self, task: ApplyTask) -> DriverResult<()> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        task();
        Ok(())
    }
}

/// Queues apply tasks until the test runs them.
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<ApplyTask>>,
    submitted: AtomicUsize,
}

impl ManualExecutor {
    /// Creates an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the oldest queued task. Returns false if none was queued.
    pub fn run_next(&self) -> bool {
        let next = self.queue.lock().pop_front();
        match next {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs every queued task. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        while self.run_next() {
            count += 1;
        }
        count
    }

    /// Returns the number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns how many tasks were ever submitted.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl ApplyExecutor for ManualExecutor {
    fn submit(&self, task: ApplyTask) -> DriverResult<()> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push_back(task);
        Ok(())
    }
}

impl std::fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("pending", &self.pending())
            .field("submitted", &self.submitted())
            .finish()
    }
}

/// Refuses every apply task.
#[derive(Debug, Default)]
pub struct RejectingExecutor {
    rejected: AtomicUsize,
}

impl RejectingExecutor {
    /// Creates an executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many tasks were refused.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

impl ApplyExecutor for RejectingExecutor {
    fn submit(&self, _task: ApplyTask) -> DriverResult<()> {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        Err(DriverError::service_unavailable("apply queue is full"))
    }
}

/// Accepts any apply order.
#[derive(Debug, Default)]
pub struct NoOrderCheck;

impl OrderVerifier for NoOrderCheck {
    fn check_apply(&self, _op_index: u64, _prepare_micros: u64) -> DriverResult<()> {
        Ok(())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicU64,
    max_error: Duration,
}

impl ManualClock {
    /// Creates a clock reading `start` with the given maximum error.
    pub fn new(start: HybridTime, max_error: Duration) -> Self {
        Self {
            micros: AtomicU64::new(start.as_micros()),
            max_error,
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> HybridTime {
        HybridTime::from_micros(self.micros.load(Ordering::SeqCst))
    }

    fn max_error(&self) -> Duration {
        self.max_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn manual_executor_defers() {
        let executor = ManualExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            executor
                .submit(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(executor.run_next());
        assert_eq!(executor.run_all(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(!executor.run_next());
    }

    #[test]
    fn frozen_clock_times_out_commit_wait() {
        let clock = ManualClock::new(HybridTime::from_micros(1_000), Duration::from_micros(10));
        let err = clock
            .wait_until_after(clock.now(), Instant::now() + Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, DriverError::TimedOut { .. }));
        clock.advance(Duration::from_millis(1));
        clock
            .wait_until_after(HybridTime::from_micros(1_000), Instant::now())
            .unwrap();
    }
}
