//! End-to-end tests for worker-pool execution.
//!
//! They exercise concurrency, the assignment predicate, fail-fast
//! draining, and recovery from a lost worker, all through the public
//! [`Runtime`] API.

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use cornichon::{
    Envelope,
    LibraryFactory,
    MessageEmitter,
    RunOptions,
    Runtime,
    Status,
    SupportCodeBuilder,
    World,
};
use futures::FutureExt;
use tokio::sync::Barrier;

use crate::common::{
    drain,
    failing_step,
    finished_cases,
    init_tracing,
    pickle,
    pickle_tagged,
    started_pickle_ids,
};

/// Worker ids carried by `TestCaseStarted` envelopes, in stream order.
fn worker_ids(envelopes: &[Envelope]) -> Vec<Option<usize>> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::TestCaseStarted { worker_id, .. } => Some(*worker_id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn pool_completes_every_case_and_tags_workers() {
    init_tracing();
    let factory: LibraryFactory = Arc::new(|| {
        SupportCodeBuilder::new()
            .step("a passing step", Arc::new(|_| async { Ok(()) }.boxed()))
            .expect("step registration")
            .build()
    });
    let options = RunOptions {
        parallel: 2,
        ..RunOptions::default()
    };
    let runtime = Runtime::new(options, factory).expect("runtime");
    let (emitter, mut rx) = MessageEmitter::channel();
    let cases: Vec<_> = (1..=4)
        .map(|n| pickle(&format!("p{n}"), &["a passing step"]))
        .collect();
    let success = runtime.run(&cases, &emitter).await.expect("run");
    drop(emitter);

    assert!(success);
    let envelopes = drain(&mut rx);
    let mut started = started_pickle_ids(&envelopes);
    started.sort();
    assert_eq!(started, vec!["p1", "p2", "p3", "p4"]);
    assert_eq!(
        finished_cases(&envelopes),
        vec![(Status::Passed, false); 4]
    );
    assert!(worker_ids(&envelopes).iter().all(Option::is_some));
}

#[tokio::test]
async fn workers_run_cases_concurrently() {
    init_tracing();
    // Both handlers must reach the barrier at the same time; with serial
    // execution the first would time out instead.
    let barrier = Arc::new(Barrier::new(2));
    let factory: LibraryFactory = {
        let barrier = Arc::clone(&barrier);
        Arc::new(move || {
            let barrier = Arc::clone(&barrier);
            SupportCodeBuilder::new()
                .step(
                    "a meeting step",
                    Arc::new(move |_| {
                        let barrier = Arc::clone(&barrier);
                        async move {
                            barrier.wait().await;
                            Ok(())
                        }
                        .boxed()
                    }),
                )
                .expect("step registration")
                .default_timeout(std::time::Duration::from_secs(1))
                .build()
        })
    };
    let options = RunOptions {
        parallel: 2,
        ..RunOptions::default()
    };
    let runtime = Runtime::new(options, factory).expect("runtime");
    let (emitter, _rx) = MessageEmitter::channel();
    let cases = vec![
        pickle("p1", &["a meeting step"]),
        pickle("p2", &["a meeting step"]),
    ];
    let success = runtime.run(&cases, &emitter).await.expect("run");
    assert!(success);
}

#[tokio::test]
async fn assignment_predicate_serializes_cases_sharing_a_tag() {
    init_tracing();
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let factory: LibraryFactory = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        Arc::new(move || {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            SupportCodeBuilder::new()
                .step(
                    "a guarded step",
                    Arc::new(move |_| {
                        let active = Arc::clone(&active);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                        .boxed()
                    }),
                )
                .expect("step registration")
                .parallel_can_assign(Arc::new(|candidate, in_flight| {
                    !candidate
                        .tags
                        .iter()
                        .any(|tag| in_flight.iter().any(|running| running.has_tag(tag)))
                }))
                .build()
        })
    };
    let options = RunOptions {
        parallel: 3,
        ..RunOptions::default()
    };
    let runtime = Runtime::new(options, factory).expect("runtime");
    let (emitter, _rx) = MessageEmitter::channel();
    let cases = vec![
        pickle_tagged("p1", &["a guarded step"], &["@db"]),
        pickle_tagged("p2", &["a guarded step"], &["@db"]),
        pickle_tagged("p3", &["a guarded step"], &["@db"]),
    ];
    let success = runtime.run(&cases, &emitter).await.expect("run");

    assert!(success);
    // The predicate keeps @db cases from overlapping despite three workers.
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lost_worker_fails_the_case_and_a_replacement_retries_it() {
    init_tracing();
    let crashed_once = Arc::new(AtomicBool::new(false));
    let factory: LibraryFactory = {
        let crashed_once = Arc::clone(&crashed_once);
        Arc::new(move || {
            let crashed_once = Arc::clone(&crashed_once);
            SupportCodeBuilder::new()
                .step("a passing step", Arc::new(|_| async { Ok(()) }.boxed()))
                .expect("step registration")
                .world(Arc::new(move |_| {
                    if !crashed_once.swap(true, Ordering::SeqCst) {
                        panic!("world construction failed");
                    }
                    World::new(())
                }))
                .build()
        })
    };
    let options = RunOptions {
        parallel: 1,
        retry: 1,
        ..RunOptions::default()
    };
    let runtime = Runtime::new(options, factory).expect("runtime");
    let (emitter, mut rx) = MessageEmitter::channel();
    let cases = vec![pickle("p1", &["a passing step"])];
    let success = runtime.run(&cases, &emitter).await.expect("run");
    drop(emitter);

    assert!(success);
    let envelopes = drain(&mut rx);
    assert_eq!(
        finished_cases(&envelopes),
        vec![(Status::Failed, true), (Status::Passed, false)]
    );
    let lost_message = envelopes
        .iter()
        .find_map(|envelope| match envelope {
            Envelope::TestCaseFinished { message, .. } => message.clone(),
            _ => None,
        })
        .expect("case-level diagnostic");
    assert_eq!(lost_message, "worker lost");
    // The retry landed on the replacement worker.
    let workers = worker_ids(&envelopes);
    assert_eq!(workers.len(), 2);
    assert_ne!(workers[0], workers[1]);
}

#[tokio::test]
async fn factory_panic_in_a_worker_is_recovered_as_a_lost_worker() {
    init_tracing();
    // Call 0 builds the coordinator's copy; call 1 is the first worker,
    // whose death must not wedge the run.
    let calls = Arc::new(AtomicU32::new(0));
    let factory: LibraryFactory = {
        let calls = Arc::clone(&calls);
        Arc::new(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("support code refused to build");
            }
            SupportCodeBuilder::new()
                .step("a passing step", Arc::new(|_| async { Ok(()) }.boxed()))
                .expect("step registration")
                .build()
        })
    };
    let options = RunOptions {
        parallel: 1,
        retry: 1,
        ..RunOptions::default()
    };
    let runtime = Runtime::new(options, factory).expect("runtime");
    let (emitter, mut rx) = MessageEmitter::channel();
    let cases = vec![pickle("p1", &["a passing step"])];
    let success = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        runtime.run(&cases, &emitter),
    )
    .await
    .expect("run completes despite a worker dying at startup")
    .expect("run");
    drop(emitter);

    assert!(success);
    let envelopes = drain(&mut rx);
    assert_eq!(
        finished_cases(&envelopes),
        vec![(Status::Failed, true), (Status::Passed, false)]
    );
    let lost_message = envelopes
        .iter()
        .find_map(|envelope| match envelope {
            Envelope::TestCaseFinished { message, .. } => message.clone(),
            _ => None,
        })
        .expect("case-level diagnostic");
    assert_eq!(lost_message, "worker lost");
}

#[tokio::test]
async fn fail_fast_drains_in_flight_work_without_new_dispatch() {
    init_tracing();
    let factory: LibraryFactory = Arc::new(|| {
        SupportCodeBuilder::new()
            .step("a failing step", failing_step("boom"))
            .expect("step registration")
            .step(
                "a slow step",
                Arc::new(|_| {
                    async {
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .expect("step registration")
            .build()
    });
    let options = RunOptions {
        parallel: 2,
        fail_fast: true,
        ..RunOptions::default()
    };
    let runtime = Runtime::new(options, factory).expect("runtime");
    let (emitter, mut rx) = MessageEmitter::channel();
    let cases = vec![
        pickle("p1", &["a failing step"]),
        pickle("p2", &["a slow step"]),
        pickle("p3", &["a slow step"]),
        pickle("p4", &["a slow step"]),
    ];
    let success = runtime.run(&cases, &emitter).await.expect("run");
    drop(emitter);

    assert!(!success);
    let envelopes = drain(&mut rx);
    let mut started = started_pickle_ids(&envelopes);
    started.sort();
    // Only the two initially-dispatched cases ever start; the in-flight
    // slow case still drains to completion.
    assert_eq!(started, vec!["p1", "p2"]);
    let mut statuses: Vec<Status> = finished_cases(&envelopes)
        .into_iter()
        .map(|(status, _)| status)
        .collect();
    statuses.sort();
    assert_eq!(statuses, vec![Status::Passed, Status::Failed]);
}
