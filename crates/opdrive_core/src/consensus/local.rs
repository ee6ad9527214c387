//! Single-node replication for tests and simulation.

use super::{ReplicateMsg, ReplicationPort, ReplicationRound};
use crate::error::{DriverError, DriverResult};
use crate::types::OpId;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// When [`LocalConsensus`] reports rounds as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Rounds stay pending until [`LocalConsensus::commit_next`] or
    /// [`LocalConsensus::commit_all`] is called.
    Manual,
    /// Rounds are committed before `replicate_batch` returns.
    Immediate,
}

struct Inner {
    next_index: u64,
    pending: VecDeque<ReplicationRound>,
    history: Vec<(OpId, ReplicateMsg)>,
    reject_next: Option<DriverError>,
}

/// A replication port that appends rounds to an in-memory log and commits
/// them in order, on demand or immediately.
pub struct LocalConsensus {
    term: u64,
    mode: CommitMode,
    inner: Mutex<Inner>,
}

impl LocalConsensus {
    /// Creates a consensus instance at term 1.
    pub fn new(mode: CommitMode) -> Self {
        Self::with_term(mode, 1)
    }

    /// Creates a consensus instance at the given term.
    pub fn with_term(mode: CommitMode, term: u64) -> Self {
        Self {
            term,
            mode,
            inner: Mutex::new(Inner {
                next_index: 1,
                pending: VecDeque::new(),
                history: Vec::new(),
                reject_next: None,
            }),
        }
    }

    /// Makes the next `replicate_batch` call fail with `error`.
    pub fn reject_next(&self, error: DriverError) {
        self.inner.lock().reject_next = Some(error);
    }

    /// Commits the oldest pending round. Returns its op id.
    pub fn commit_next(&self) -> Option<OpId> {
        let round = self.inner.lock().pending.pop_front();
        round.map(|mut round| {
            let id = round.id();
            round.notify_replication_finished(Ok(()));
            id
        })
    }

    /// Commits every pending round in order. Returns how many were committed.
    pub fn commit_all(&self) -> usize {
        let mut count = 0;
        while self.commit_next().is_some() {
            count += 1;
        }
        count
    }

    /// Fails every pending round with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: DriverError) -> usize {
        let rounds: Vec<_> = self.inner.lock().pending.drain(..).collect();
        let count = rounds.len();
        for mut round in rounds {
            round.notify_replication_finished(Err(error.clone()));
        }
        count
    }

    /// Returns the number of appended but uncommitted rounds.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns every message appended so far, in op id order.
    pub fn history(&self) -> Vec<(OpId, ReplicateMsg)> {
        self.inner.lock().history.clone()
    }

    /// Returns the op id the next appended round will receive.
    pub fn next_op_id(&self) -> OpId {
        OpId::new(self.term, self.inner.lock().next_index)
    }
}

impl ReplicationPort for LocalConsensus {
    fn replicate_batch(&self, rounds: Vec<ReplicationRound>) -> DriverResult<()> {
        if rounds.is_empty() {
            return Err(DriverError::invalid_argument("empty replication batch"));
        }

        let mut appended = Vec::with_capacity(rounds.len());
        {
            let mut inner = self.inner.lock();
            if let Some(error) = inner.reject_next.take() {
                return Err(error);
            }
            for round in rounds {
                let op_id = OpId::new(self.term, inner.next_index);
                inner.next_index += 1;
                inner.history.push((op_id, round.msg().clone()));
                appended.push((op_id, round));
            }
        }

        // Callbacks run without the lock held; they re-enter the driver.
        let mut bound = Vec::with_capacity(appended.len());
        for (op_id, mut round) in appended {
            round.bind_to_op_id(op_id);
            bound.push(round);
        }

        match self.mode {
            CommitMode::Immediate => {
                for mut round in bound {
                    round.notify_replication_finished(Ok(()));
                }
            }
            CommitMode::Manual => self.inner.lock().pending.extend(bound),
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConsensus")
            .field("term", &self.term)
            .field("mode", &self.mode)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HybridTime, OperationType};
    use std::sync::Arc;

    fn round(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> ReplicationRound {
        let appended = Arc::clone(log);
        let finished = Arc::clone(log);
        ReplicationRound::new(
            ReplicateMsg {
                op_type: OperationType::Write,
                hybrid_time: HybridTime::from_micros(1),
                payload: tag.as_bytes().to_vec(),
            },
            Box::new(move |id| appended.lock().push(format!("append {tag} {id}"))),
            Box::new(move |id, status| {
                finished
                    .lock()
                    .push(format!("finish {tag} {id} {}", status.is_ok()))
            }),
        )
    }

    #[test]
    fn manual_commit_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let consensus = LocalConsensus::new(CommitMode::Manual);

        consensus
            .replicate_batch(vec![round(&log, "a"), round(&log, "b")])
            .unwrap();
        assert_eq!(consensus.pending_count(), 2);

        assert_eq!(consensus.commit_next(), Some(OpId::new(1, 1)));
        assert_eq!(consensus.commit_all(), 1);
        assert_eq!(consensus.commit_next(), None);

        assert_eq!(
            *log.lock(),
            vec![
                "append a 1.1",
                "append b 1.2",
                "finish a 1.1 true",
                "finish b 1.2 true",
            ]
        );
    }

    #[test]
    fn immediate_commit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let consensus = LocalConsensus::with_term(CommitMode::Immediate, 4);

        consensus.replicate_batch(vec![round(&log, "a")]).unwrap();
        assert_eq!(consensus.pending_count(), 0);
        assert_eq!(*log.lock(), vec!["append a 4.1", "finish a 4.1 true"]);
        assert_eq!(consensus.next_op_id(), OpId::new(4, 2));
    }

    #[test]
    fn rejected_batch_fires_no_callbacks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let consensus = LocalConsensus::new(CommitMode::Manual);
        consensus.reject_next(DriverError::replication_rejected("not leader"));

        let err = consensus.replicate_batch(vec![round(&log, "a")]).unwrap_err();
        assert!(matches!(err, DriverError::ReplicationRejected { .. }));
        assert!(log.lock().is_empty());
        assert!(consensus.history().is_empty());
    }

    #[test]
    fn fail_all_reports_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let consensus = LocalConsensus::new(CommitMode::Manual);
        consensus.replicate_batch(vec![round(&log, "a")]).unwrap();

        assert_eq!(
            consensus.fail_all(DriverError::replication_failed("lost leadership")),
            1
        );
        assert!(log.lock().contains(&"finish a 1.1 false".to_string()));
    }
}
