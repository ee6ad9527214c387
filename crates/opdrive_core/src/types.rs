//! Core type definitions for the driver.

use serde::Serialize;
use std::fmt;

/// Identifier assigned to an operation by the replication layer.
///
/// An op id is a `(term, index)` pair. The default value is the unset id;
/// a driver reports it until the replication layer assigns a real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct OpId {
    /// Consensus term the operation was appended in.
    pub term: u64,
    /// Position of the operation in the replicated log.
    pub index: u64,
}

impl OpId {
    /// The unset op id.
    pub const UNSET: OpId = OpId { term: 0, index: 0 };

    /// Creates a new op id.
    #[must_use]
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// Returns true if the id has been assigned by the replication layer.
    #[must_use]
    pub const fn is_set(self) -> bool {
        self.index != 0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{}.{}", self.term, self.index)
        } else {
            f.write_str("<unset>")
        }
    }
}

/// A hybrid timestamp, in microseconds.
///
/// Leaders assign one when an operation starts; followers reuse the value the
/// leader replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HybridTime(pub u64);

impl HybridTime {
    /// Creates a hybrid time from microseconds.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Returns the raw microsecond value.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ht:{}", self.0)
    }
}

/// Process-unique identifier of a driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverId(pub u64);

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Kind of operation carried by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationType {
    /// A row write against a tablet.
    Write,
    /// A schema change.
    AlterSchema,
    /// A change to the replication configuration.
    ChangeConfig,
    /// Any other replicated operation.
    Other,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Write => "WRITE",
            OperationType::AlterSchema => "ALTER_SCHEMA",
            OperationType::ChangeConfig => "CHANGE_CONFIG",
            OperationType::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// Consistency mode requested by the operation's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    /// Results become visible as soon as the commit record is durable.
    #[default]
    ClientPropagated,
    /// Before results become visible, wait until the clock is certainly past
    /// the operation's hybrid time.
    CommitWait,
}

/// How an operation ended, as reported to its `finish` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// The operation was applied and its effects are visible.
    Committed,
    /// The operation did not take effect.
    Aborted,
}

/// Success reply delivered to the caller of a finalized operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    /// Op id the operation committed at.
    pub op_id: OpId,
    /// Hybrid time assigned to the operation.
    pub hybrid_time: HybridTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_id_unset_by_default() {
        assert_eq!(OpId::default(), OpId::UNSET);
        assert!(!OpId::default().is_set());
        assert!(OpId::new(1, 1).is_set());
    }

    #[test]
    fn op_id_ordering() {
        assert!(OpId::new(1, 5) < OpId::new(1, 6));
        assert!(OpId::new(1, 9) < OpId::new(2, 1));
    }

    #[test]
    fn op_id_display() {
        assert_eq!(OpId::new(3, 17).to_string(), "3.17");
        assert_eq!(OpId::UNSET.to_string(), "<unset>");
    }

    #[test]
    fn operation_type_display() {
        assert_eq!(OperationType::Write.to_string(), "WRITE");
        assert_eq!(OperationType::ChangeConfig.to_string(), "CHANGE_CONFIG");
    }
}
