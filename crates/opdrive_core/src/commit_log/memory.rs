//! In-memory commit log.

use super::{CommitRecord, DurabilityLog, LogCallback};
use crate::error::{DriverError, DriverResult};
use parking_lot::Mutex;

/// When [`MemoryLog`] reports appended records as durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSyncMode {
    /// Before `append_commit` returns.
    Immediate,
    /// When [`MemoryLog::sync`] is called.
    Deferred,
}

#[derive(Default)]
struct Inner {
    durable: Vec<CommitRecord>,
    unsynced: Vec<(CommitRecord, LogCallback)>,
    reject_next: Option<DriverError>,
    fail_next_sync: Option<DriverError>,
}

/// A durability log holding commit records in memory.
pub struct MemoryLog {
    mode: LogSyncMode,
    inner: Mutex<Inner>,
}

impl MemoryLog {
    /// Creates an empty log.
    pub fn new(mode: LogSyncMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Makes the next append be refused with `error`.
    pub fn reject_next(&self, error: DriverError) {
        self.inner.lock().reject_next = Some(error);
    }

    /// Makes the next accepted append fail to persist with `error`.
    pub fn fail_next_sync(&self, error: DriverError) {
        self.inner.lock().fail_next_sync = Some(error);
    }

    /// Persists every unsynced record and fires their callbacks in order.
    /// Returns how many records were synced.
    pub fn sync(&self) -> usize {
        let unsynced: Vec<_> = {
            let mut inner = self.inner.lock();
            let batch: Vec<_> = inner.unsynced.drain(..).collect();
            inner.durable.extend(batch.iter().map(|(r, _)| r.clone()));
            batch
        };
        let count = unsynced.len();
        for (_, on_durable) in unsynced {
            on_durable(Ok(()));
        }
        count
    }

    /// Returns the durable records, in append order.
    pub fn records(&self) -> Vec<CommitRecord> {
        self.inner.lock().durable.clone()
    }

    /// Returns the number of accepted records not yet durable.
    pub fn unsynced_count(&self) -> usize {
        self.inner.lock().unsynced.len()
    }
}

impl DurabilityLog for MemoryLog {
    fn append_commit(&self, record: CommitRecord, on_durable: LogCallback) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.reject_next.take() {
            return Err(error);
        }
        if let Some(error) = inner.fail_next_sync.take() {
            drop(inner);
            on_durable(Err(error));
            return Ok(());
        }
        match self.mode {
            LogSyncMode::Immediate => {
                inner.durable.push(record);
                drop(inner);
                on_durable(Ok(()));
            }
            LogSyncMode::Deferred => inner.unsynced.push((record, on_durable)),
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryLog")
            .field("mode", &self.mode)
            .field("durable", &inner.durable.len())
            .field("unsynced", &inner.unsynced.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HybridTime, OpId, OperationType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn record(index: u64) -> CommitRecord {
        CommitRecord {
            op_id: OpId::new(1, index),
            op_type: OperationType::Write,
            hybrid_time: HybridTime::from_micros(index),
            result: vec![],
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> LogCallback {
        let counter = Arc::clone(counter);
        Box::new(move |status| {
            assert!(status.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn immediate_sync() {
        let log = MemoryLog::new(LogSyncMode::Immediate);
        let durable = Arc::new(AtomicUsize::new(0));

        log.append_commit(record(1), counting(&durable)).unwrap();
        assert_eq!(durable.load(Ordering::SeqCst), 1);
        assert_eq!(log.records(), vec![record(1)]);
    }

    #[test]
    fn deferred_sync() {
        let log = MemoryLog::new(LogSyncMode::Deferred);
        let durable = Arc::new(AtomicUsize::new(0));

        log.append_commit(record(1), counting(&durable)).unwrap();
        log.append_commit(record(2), counting(&durable)).unwrap();
        assert_eq!(durable.load(Ordering::SeqCst), 0);
        assert!(log.records().is_empty());
        assert_eq!(log.unsynced_count(), 2);

        assert_eq!(log.sync(), 2);
        assert_eq!(durable.load(Ordering::SeqCst), 2);
        assert_eq!(log.records(), vec![record(1), record(2)]);
    }

    #[test]
    fn rejected_append_skips_callback() {
        let log = MemoryLog::new(LogSyncMode::Immediate);
        log.reject_next(DriverError::log_append_failed("disk full"));

        let result = log.append_commit(record(1), Box::new(|_| panic!("must not run")));
        assert!(matches!(result, Err(DriverError::LogAppendFailed { .. })));
        assert!(log.records().is_empty());
    }

    #[test]
    fn failed_sync_reports_error() {
        let log = MemoryLog::new(LogSyncMode::Immediate);
        log.fail_next_sync(DriverError::log_append_failed("fsync"));

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        log.append_commit(record(1), Box::new(move |status| *s.lock() = Some(status)))
            .unwrap();
        assert!(matches!(*seen.lock(), Some(Err(DriverError::LogAppendFailed { .. }))));
    }
}
