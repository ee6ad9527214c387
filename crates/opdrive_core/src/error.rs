//! Error types for the transaction driver.

use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while driving an operation.
///
/// Errors are `Clone` because a single failure status can fan out to many
/// drivers, e.g. every driver of a replication batch that was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// An argument supplied by the caller was invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The driver is not in a state that permits the call.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description of why the call is not permitted.
        message: String,
    },

    /// A state transition would have moved a state dimension backwards.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A queue or admission limit was hit.
    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        /// Which resource was exhausted.
        message: String,
    },

    /// The replication port refused to accept a round.
    #[error("replication rejected: {message}")]
    ReplicationRejected {
        /// Reason given by the replication port.
        message: String,
    },

    /// Replication was accepted but did not reach a quorum.
    #[error("replication failed: {message}")]
    ReplicationFailed {
        /// Reason given by the replication port.
        message: String,
    },

    /// The operation's prepare or start hook failed.
    #[error("prepare failed: {message}")]
    PrepareFailed {
        /// Reason reported by the operation.
        message: String,
    },

    /// The operation's apply hook failed.
    #[error("apply failed: {message}")]
    ApplyFailed {
        /// Reason reported by the operation.
        message: String,
    },

    /// The apply executor refused the apply task.
    #[error("apply rejected: {message}")]
    ApplyRejected {
        /// Reason given by the apply executor.
        message: String,
    },

    /// The durability log refused or failed to persist a commit record.
    #[error("commit log append failed: {message}")]
    LogAppendFailed {
        /// Reason given by the durability log.
        message: String,
    },

    /// The operation was aborted before it was replicated.
    #[error("operation aborted: {reason}")]
    Aborted {
        /// Reason for the abort.
        reason: String,
    },

    /// An abort was requested while replication was in flight and the round
    /// was committed anyway. The operation took effect.
    #[error("operation aborted after replication was submitted, but it committed: {reason}")]
    AbortedAfterReplication {
        /// Reason for the abort.
        reason: String,
    },

    /// A bounded wait ran out of time.
    #[error("timed out: {message}")]
    TimedOut {
        /// What was being waited for.
        message: String,
    },

    /// An operation was applied out of replicated order.
    #[error("apply order violation: {message}")]
    OrderViolation {
        /// Description of the violation.
        message: String,
    },
}

impl DriverError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates an invalid state transition error.
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates a service unavailable error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// Creates a replication rejected error.
    pub fn replication_rejected(message: impl Into<String>) -> Self {
        Self::ReplicationRejected {
            message: message.into(),
        }
    }

    /// Creates a replication failed error.
    pub fn replication_failed(message: impl Into<String>) -> Self {
        Self::ReplicationFailed {
            message: message.into(),
        }
    }

    /// Creates a prepare failed error.
    pub fn prepare_failed(message: impl Into<String>) -> Self {
        Self::PrepareFailed {
            message: message.into(),
        }
    }

    /// Creates an apply failed error.
    pub fn apply_failed(message: impl Into<String>) -> Self {
        Self::ApplyFailed {
            message: message.into(),
        }
    }

    /// Creates an apply rejected error.
    pub fn apply_rejected(message: impl Into<String>) -> Self {
        Self::ApplyRejected {
            message: message.into(),
        }
    }

    /// Creates a log append failed error.
    pub fn log_append_failed(message: impl Into<String>) -> Self {
        Self::LogAppendFailed {
            message: message.into(),
        }
    }

    /// Creates an aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Creates the error reported when an abort arrived too late to stop
    /// replication.
    pub fn aborted_after_replication(reason: impl Into<String>) -> Self {
        Self::AbortedAfterReplication {
            reason: reason.into(),
        }
    }

    /// Creates a timed out error.
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::TimedOut {
            message: message.into(),
        }
    }

    /// Creates an order violation error.
    pub fn order_violation(message: impl Into<String>) -> Self {
        Self::OrderViolation {
            message: message.into(),
        }
    }

    /// Returns the abort reason if this error is an abort.
    pub fn abort_reason(&self) -> Option<&str> {
        match self {
            Self::Aborted { reason } | Self::AbortedAfterReplication { reason } => Some(reason),
            _ => None,
        }
    }

    /// Returns true if the error is transient and the caller may resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. }
                | Self::ReplicationRejected { .. }
                | Self::TimedOut { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = DriverError::service_unavailable("prepare queue is full");
        assert_eq!(err.to_string(), "service unavailable: prepare queue is full");

        let err = DriverError::invalid_transition("REPLICATED", "REPLICATING");
        assert!(err.to_string().contains("REPLICATED"));
        assert!(err.to_string().contains("REPLICATING"));
    }

    #[test]
    fn abort_reason() {
        assert_eq!(DriverError::aborted("shutdown").abort_reason(), Some("shutdown"));
        let after = DriverError::AbortedAfterReplication {
            reason: "client gone".into(),
        };
        assert_eq!(after.abort_reason(), Some("client gone"));
        assert_eq!(DriverError::apply_failed("x").abort_reason(), None);
    }

    #[test]
    fn retryable_errors() {
        assert!(DriverError::service_unavailable("full").is_retryable());
        assert!(DriverError::replication_rejected("not leader").is_retryable());
        assert!(!DriverError::replication_failed("lost leadership").is_retryable());
        assert!(!DriverError::aborted("x").is_retryable());
    }
}
