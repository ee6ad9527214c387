//! Property tests over the order of prepare, replication, abort and apply.

use opdrive_core::{DriverError, OperationResult};
use opdrive_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
enum Expected {
    Committed,
    CommittedAfterAbort,
    Aborted,
    ReplicationFailed,
}

fn manual() -> DriverHarness {
    DriverHarness::builder()
        .prepare(PrepareMode::Manual)
        .apply(ApplyMode::Manual)
        .build()
}

fn classify(reply: &Result<opdrive_core::CommitSummary, DriverError>) -> Expected {
    match reply {
        Ok(_) => Expected::Committed,
        Err(DriverError::AbortedAfterReplication { .. }) => Expected::CommittedAfterAbort,
        Err(DriverError::Aborted { .. }) => Expected::Aborted,
        Err(DriverError::ReplicationFailed { .. }) => Expected::ReplicationFailed,
        Err(other) => panic!("unexpected reply: {other}"),
    }
}

// An abort before the replication outcome is deferred, except on a leader
// that has not prepared yet, where it fails the driver outright.
fn expected(events: &[DriverEvent], leader: bool) -> Expected {
    let mut prepared = false;
    let mut aborted = false;
    for event in events {
        match event {
            DriverEvent::Prepare => prepared = true,
            DriverEvent::Abort if leader && !prepared => return Expected::Aborted,
            DriverEvent::Abort => aborted = true,
            DriverEvent::ReplicationOk if aborted => return Expected::CommittedAfterAbort,
            DriverEvent::ReplicationOk => return Expected::Committed,
            DriverEvent::ReplicationFailed if aborted => return Expected::Aborted,
            DriverEvent::ReplicationFailed => return Expected::ReplicationFailed,
            DriverEvent::Apply => {}
        }
    }
    Expected::Aborted
}

proptest! {
    #[test]
    fn follower_applies_once_after_both_completions(events in follower_schedule_strategy()) {
        let harness = manual();
        let launched = harness.start_follower(TestOperation::new());
        let mut prepared = false;
        let mut replicated = false;

        for event in &events {
            let applied_before = launched.recorder.apply_count();
            match event {
                DriverEvent::Prepare => {
                    harness.run_prepare();
                    prepared = true;
                }
                DriverEvent::ReplicationOk => {
                    launched.driver.replication_finished(Ok(()));
                    replicated = true;
                }
                DriverEvent::ReplicationFailed => {
                    launched
                        .driver
                        .replication_finished(Err(DriverError::replication_failed("term changed")));
                }
                DriverEvent::Abort => launched.driver.abort(DriverError::aborted("test")),
                DriverEvent::Apply => {
                    harness.run_apply();
                }
            }
            if launched.recorder.apply_count() > applied_before {
                prop_assert!(prepared && replicated);
            }
        }

        prop_assert!(launched.recorder.apply_count() <= 1);
        prop_assert!(harness.apply_submissions() <= 1);

        let reply = launched.reply.try_recv();
        prop_assert!(reply.is_some(), "no reply after {:?}", events);
        let reply = reply.unwrap();
        prop_assert!(launched.reply.try_recv().is_none());
        let kind = classify(&reply);
        prop_assert_eq!(&kind, &expected(&events, false));

        let finished = launched.recorder.finish_results();
        prop_assert_eq!(finished.len(), 1);
        let committed = matches!(kind, Expected::Committed | Expected::CommittedAfterAbort);
        prop_assert_eq!(committed, finished[0] == OperationResult::Committed);
        prop_assert_eq!(committed, launched.recorder.is_visible());
        prop_assert_eq!(harness.tracker.pending_count(), 0);
    }

    #[test]
    fn leader_replies_once(events in leader_schedule_strategy()) {
        let harness = manual();
        let launched = harness.start_leader(TestOperation::new());

        for event in &events {
            match event {
                DriverEvent::Prepare => {
                    harness.run_prepare();
                }
                DriverEvent::ReplicationOk => {
                    harness.consensus.commit_all();
                }
                DriverEvent::ReplicationFailed => {
                    harness
                        .consensus
                        .fail_all(DriverError::replication_failed("lost leadership"));
                }
                DriverEvent::Abort => launched.driver.abort(DriverError::aborted("test")),
                DriverEvent::Apply => {
                    harness.run_apply();
                }
            }
        }

        let reply = launched.reply.try_recv();
        prop_assert!(reply.is_some(), "no reply after {:?}", events);
        let kind = classify(&reply.unwrap());
        prop_assert_eq!(&kind, &expected(&events, true));
        prop_assert!(launched.recorder.apply_count() <= 1);
        prop_assert_eq!(launched.recorder.finish_results().len(), 1);
        if kind == Expected::Aborted && events.first() == Some(&DriverEvent::Abort) {
            prop_assert_eq!(launched.recorder.prepare_count(), 0);
            prop_assert!(harness.consensus.history().is_empty());
        }
        prop_assert_eq!(harness.tracker.pending_count(), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn racing_prepare_and_replication_apply_in_order(delays in thread_delays_strategy(2)) {
        const FOLLOWERS: usize = 3;
        let harness = DriverHarness::builder().prepare(PrepareMode::Manual).build();
        let launched: Vec<Launched> = (0..FOLLOWERS)
            .map(|_| harness.start_follower(TestOperation::new()))
            .collect();
        let drivers: Vec<_> = launched.iter().map(|l| Arc::clone(&l.driver)).collect();

        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(delays[0]);
                while harness.run_prepare() {}
            });
            scope.spawn(|| {
                thread::sleep(delays[1]);
                for driver in &drivers {
                    driver.replication_finished(Ok(()));
                }
            });
        });

        for (i, l) in launched.iter().enumerate() {
            let reply = l.reply.wait_timeout(Duration::from_secs(5));
            prop_assert!(matches!(reply, Some(Ok(_))), "follower {} got {:?}", i, reply);
            prop_assert_eq!(l.recorder.apply_count(), 1);
        }
        prop_assert_eq!(harness.verifier.last_index(), FOLLOWERS as u64);
    }
}
