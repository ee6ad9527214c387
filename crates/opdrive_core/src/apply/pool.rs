//! Fixed-size apply thread pool.

use super::{ApplyExecutor, ApplyTask};
use crate::config::ApplyPoolConfig;
use crate::error::{DriverError, DriverResult};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A bounded FIFO queue drained by a fixed number of worker threads.
///
/// Submission never blocks: when the queue is full the task is refused with
/// `ServiceUnavailable`.
pub struct ApplyPool {
    config: ApplyPoolConfig,
    sender: Mutex<Option<SyncSender<ApplyTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ApplyPool {
    /// Starts the pool's worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a thread could not
    /// be spawned.
    pub fn new(config: ApplyPoolConfig) -> DriverResult<Self> {
        if config.threads == 0 || config.queue_capacity == 0 {
            return Err(DriverError::invalid_argument(
                "apply pool needs at least one thread and one queue slot",
            ));
        }

        let (sender, receiver) = mpsc::sync_channel::<ApplyTask>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(config.threads);
        for i in 0..config.threads {
            let rx = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("apply-{i}"))
                .spawn(move || worker_loop(&rx))
                .map_err(|e| DriverError::illegal_state(format!("spawn apply worker: {e}")))?;
            workers.push(handle);
        }

        tracing::debug!(threads = config.threads, capacity = config.queue_capacity, "apply pool started");

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> ApplyPoolConfig {
        self.config
    }

    /// Stops accepting tasks, drains the queue and joins the workers.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            // The last reference may be released by a task on a worker.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("apply worker exited by panic");
            }
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<ApplyTask>>) {
    loop {
        let task = receiver.lock().recv();
        match task {
            Ok(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("apply task panicked");
                }
            }
            Err(_) => break,
        }
    }
}

impl ApplyExecutor for ApplyPool {
    fn submit(&self, task: ApplyTask) -> DriverResult<()> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(DriverError::illegal_state("apply pool is shut down"));
        };
        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => DriverError::service_unavailable("apply queue is full"),
            TrySendError::Disconnected(_) => DriverError::illegal_state("apply pool is shut down"),
        })
    }
}

impl Drop for ApplyPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ApplyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn runs_tasks() {
        let pool = ApplyPool::new(ApplyPoolConfig::new().threads(2)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let c = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn rejects_when_full() {
        let pool = ApplyPool::new(ApplyPoolConfig::new().threads(1).queue_capacity(1)).unwrap();
        let (block_tx, block_rx) = channel::<()>();
        let (started_tx, started_rx) = channel::<()>();

        // Occupy the only worker.
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.submit(Box::new(|| {})).unwrap();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, DriverError::ServiceUnavailable { .. }));

        block_tx.send(()).unwrap();
    }

    #[test]
    fn rejects_after_shutdown() {
        let pool = ApplyPool::new(ApplyPoolConfig::default()).unwrap();
        pool.shutdown();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, DriverError::IllegalState { .. }));
    }

    #[test]
    fn survives_panicking_task() {
        let pool = ApplyPool::new(ApplyPoolConfig::new().threads(1)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let c = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_threads_is_invalid() {
        assert!(ApplyPool::new(ApplyPoolConfig::new().threads(0)).is_err());
        assert!(ApplyPool::new(ApplyPoolConfig::new().queue_capacity(0)).is_err());
    }
}
