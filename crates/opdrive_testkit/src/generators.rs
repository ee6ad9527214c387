//! Property-based test generators using proptest.
//!
//! Strategies for event orders and thread schedules that exercise the race
//! between prepare finishing and replication finishing.

use opdrive_core::{ConsistencyMode, OperationType};
use proptest::prelude::*;
use std::time::Duration;

/// An externally triggered event in one driver's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// Run the driver's queued prepare.
    Prepare,
    /// Report replication success.
    ReplicationOk,
    /// Report replication failure.
    ReplicationFailed,
    /// Request an abort.
    Abort,
    /// Run the driver's queued apply task, if any.
    Apply,
}

/// Strategy for one follower driver's event order.
///
/// Prepare and replication appear exactly once each, in either order; an
/// abort is inserted at a random point half the time; apply attempts are
/// sprinkled in between and at the end.
pub fn follower_schedule_strategy() -> impl Strategy<Value = Vec<DriverEvent>> {
    (
        any::<bool>(),
        prop_oneof![3 => Just(DriverEvent::ReplicationOk), 1 => Just(DriverEvent::ReplicationFailed)],
        proptest::option::of(0usize..3),
        proptest::collection::vec(0usize..3, 0..3),
    )
        .prop_map(|(prepare_first, replication, abort_at, apply_at)| {
            let mut events = if prepare_first {
                vec![DriverEvent::Prepare, replication]
            } else {
                vec![replication, DriverEvent::Prepare]
            };
            for at in apply_at {
                events.insert(at.min(events.len()), DriverEvent::Apply);
            }
            if let Some(at) = abort_at {
                events.insert(at.min(events.len()), DriverEvent::Abort);
            }
            events.push(DriverEvent::Apply);
            events
        })
}

/// Strategy for a leader driver's event order.
///
/// Prepare always comes first, since a leader cannot replicate before it is
/// prepared; the rest is shuffled.
pub fn leader_schedule_strategy() -> impl Strategy<Value = Vec<DriverEvent>> {
    (
        prop_oneof![3 => Just(DriverEvent::ReplicationOk), 1 => Just(DriverEvent::ReplicationFailed)],
        proptest::option::of(0usize..3),
    )
        .prop_map(|(replication, abort_at)| {
            let mut events = vec![DriverEvent::Prepare, replication, DriverEvent::Apply];
            if let Some(at) = abort_at {
                events.insert(at, DriverEvent::Abort);
            }
            events
        })
}

/// Strategy for per-thread start delays, to shake up real thread schedules.
pub fn thread_delays_strategy(threads: usize) -> impl Strategy<Value = Vec<Duration>> {
    proptest::collection::vec((0u64..500).prop_map(Duration::from_micros), threads)
}

/// Strategy for operation kinds.
pub fn op_type_strategy() -> impl Strategy<Value = OperationType> {
    prop_oneof![
        4 => Just(OperationType::Write),
        1 => Just(OperationType::AlterSchema),
        1 => Just(OperationType::ChangeConfig),
        1 => Just(OperationType::Other),
    ]
}

/// Strategy for consistency modes.
pub fn consistency_strategy() -> impl Strategy<Value = ConsistencyMode> {
    prop_oneof![
        3 => Just(ConsistencyMode::ClientPropagated),
        1 => Just(ConsistencyMode::CommitWait),
    ]
}

/// Strategy for replicated payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..64)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn follower_schedule_has_both_completions(events in follower_schedule_strategy()) {
            let prepares = events.iter().filter(|e| **e == DriverEvent::Prepare).count();
            let replications = events
                .iter()
                .filter(|e| matches!(e, DriverEvent::ReplicationOk | DriverEvent::ReplicationFailed))
                .count();
            prop_assert_eq!(prepares, 1);
            prop_assert_eq!(replications, 1);
            prop_assert_eq!(events.last(), Some(&DriverEvent::Apply));
        }

        #[test]
        fn leader_schedule_prepares_first(events in leader_schedule_strategy()) {
            let first = events.iter().find(|e| **e != DriverEvent::Abort);
            prop_assert_eq!(first, Some(&DriverEvent::Prepare));
        }
    }
}
