//! Single-threaded prepare queue with leader-side batching.

use super::PrepareScheduler;
use crate::config::PrepareConfig;
use crate::consensus::{ReplicationPort, ReplicationRound};
use crate::driver::TransactionDriver;
use crate::error::{DriverError, DriverResult};
use crate::stats::DriverStats;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Prepares drivers in submission order on one worker thread.
///
/// Consecutive leader-side drivers are batched: their rounds go to the
/// replication port in one `replicate_batch` call once the queue runs dry or
/// the batch reaches [`PrepareConfig::max_batch_size`]. A follower driver
/// flushes the pending batch before it is prepared, so rounds reach the
/// replication port in submission order.
pub struct PrepareThread {
    config: PrepareConfig,
    sender: Mutex<Option<SyncSender<Arc<TransactionDriver>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PrepareThread {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the thread could
    /// not be spawned.
    pub fn new(
        config: PrepareConfig,
        replication: Arc<dyn ReplicationPort>,
        stats: Arc<DriverStats>,
    ) -> DriverResult<Self> {
        if config.max_batch_size == 0 || config.queue_capacity == 0 {
            return Err(DriverError::invalid_argument(
                "prepare queue capacity and batch size must be at least 1",
            ));
        }

        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let batcher = Batcher {
            max: config.max_batch_size,
            pending: Vec::new(),
            replication,
            stats,
        };
        let worker = thread::Builder::new()
            .name("prepare".into())
            .spawn(move || run(&receiver, batcher))
            .map_err(|e| DriverError::illegal_state(format!("spawn prepare worker: {e}")))?;

        tracing::debug!(
            capacity = config.queue_capacity,
            max_batch = config.max_batch_size,
            "prepare thread started"
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> PrepareConfig {
        self.config
    }

    /// Stops accepting drivers, prepares the queued ones and joins the worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        // The last reference may be dropped by a driver on the worker itself.
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            tracing::error!("prepare worker exited by panic");
        }
    }
}

impl PrepareScheduler for PrepareThread {
    fn submit(&self, driver: Arc<TransactionDriver>) -> DriverResult<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(DriverError::illegal_state("prepare thread is shut down"));
        };
        sender.try_send(driver).map_err(|e| match e {
            TrySendError::Full(_) => DriverError::service_unavailable("prepare queue is full"),
            TrySendError::Disconnected(_) => DriverError::illegal_state("prepare thread is shut down"),
        })
    }
}

impl Drop for PrepareThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PrepareThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrepareThread")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Batcher {
    max: usize,
    pending: Vec<(Arc<TransactionDriver>, ReplicationRound)>,
    replication: Arc<dyn ReplicationPort>,
    stats: Arc<DriverStats>,
}

impl Batcher {
    fn process(&mut self, driver: Arc<TransactionDriver>) {
        if self.max > 1 && driver.is_leader_side() {
            match driver.prepare_and_start() {
                Ok(Some(round)) => {
                    self.pending.push((driver, round));
                    if self.pending.len() >= self.max {
                        self.flush();
                    }
                }
                Ok(None) => {}
                Err(e) => driver.handle_failure(e),
            }
        } else {
            self.flush();
            driver.prepare_and_start_task();
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let (drivers, rounds): (Vec<_>, Vec<_>) = self.pending.drain(..).unzip();
        self.stats.record_batch(rounds.len());
        if let Err(e) = self.replication.replicate_batch(rounds) {
            tracing::warn!(rounds = drivers.len(), error = %e, "replication batch rejected");
            for driver in drivers {
                driver.set_replication_failed(e.clone());
                driver.handle_failure(e.clone());
            }
        }
    }
}

fn run(receiver: &Receiver<Arc<TransactionDriver>>, mut batcher: Batcher) {
    while let Ok(driver) = receiver.recv() {
        batcher.process(driver);
        while let Ok(driver) = receiver.try_recv() {
            batcher.process(driver);
        }
        batcher.flush();
    }
    batcher.flush();
}
