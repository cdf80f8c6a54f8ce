//! Worker-pool execution adapter.
//!
//! Workers are isolated tasks, each owning a private support library
//! built from the run's factory, so handler state never crosses worker
//! boundaries. The coordinator owns the queue: it picks the next case
//! the assignment predicate admits against the in-flight set, hands it
//! to an idle worker, and settles the case when the worker reports back.
//! Workers write step-level envelopes straight to the shared emitter, so
//! the stream interleaves in real time while each case's own sequence
//! stays ordered.
//!
//! A worker that panics outside handler code is reported as crashed; its
//! in-flight case fails with a "worker lost" diagnostic and a
//! replacement worker is spawned so capacity stays at the configured
//! level.

use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

use super::{
    CaseRunner,
    LibraryFactory,
    RunOptions,
    local::LocalRunner,
    policy::{RetryPolicy, RunAggregate},
};
use crate::{
    event::{Envelope, IdGenerator, MessageEmitter, Status, timestamp_ms},
    executor::AttemptOutcome,
    pickle::Pickle,
    support::SupportCodeLibrary,
};

enum WorkerCommand {
    Run {
        pickle: Arc<Pickle>,
        attempt: u32,
        case_started_id: u64,
    },
    Shutdown,
}

enum WorkerReport {
    CaseFinished {
        worker_id: usize,
        outcome: AttemptOutcome,
    },
    Crashed {
        worker_id: usize,
    },
}

struct InFlight {
    pickle: Arc<Pickle>,
    attempt: u32,
    case_started_id: u64,
}

struct Pool<'a> {
    options: &'a RunOptions,
    policy: &'a RetryPolicy,
    /// Coordinator-side copy, consulted for the assignment predicate only.
    library: &'a SupportCodeLibrary,
    emitter: &'a MessageEmitter,
    ids: &'a Arc<IdGenerator>,
    factory: LibraryFactory,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
    senders: HashMap<usize, mpsc::UnboundedSender<WorkerCommand>>,
    idle: Vec<usize>,
    in_flight: HashMap<usize, InFlight>,
    queue: VecDeque<(Arc<Pickle>, u32)>,
    aggregate: RunAggregate,
    halted: bool,
    next_worker_id: usize,
}

/// Run the cases on `options.parallel` workers.
pub(crate) async fn run_pool(
    factory: LibraryFactory,
    library: &SupportCodeLibrary,
    options: &RunOptions,
    policy: &RetryPolicy,
    pickles: &[Arc<Pickle>],
    emitter: &MessageEmitter,
    ids: &Arc<IdGenerator>,
) -> RunAggregate {
    let workers = options.parallel.max(1);
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let mut pool = Pool {
        options,
        policy,
        library,
        emitter,
        ids,
        factory,
        tracker: TaskTracker::new(),
        shutdown: CancellationToken::new(),
        report_tx,
        senders: HashMap::new(),
        idle: Vec::new(),
        in_flight: HashMap::new(),
        queue: pickles.iter().map(|p| (Arc::clone(p), 0)).collect(),
        aggregate: RunAggregate::default(),
        halted: false,
        next_worker_id: 0,
    };
    for _ in 0..workers {
        pool.spawn_worker();
    }

    loop {
        pool.dispatch();
        if pool.queue.is_empty() && pool.in_flight.is_empty() {
            break;
        }
        match report_rx.recv().await {
            Some(WorkerReport::CaseFinished { worker_id, outcome }) => {
                pool.on_case_finished(worker_id, outcome);
            }
            Some(WorkerReport::Crashed { worker_id }) => pool.on_worker_crashed(worker_id),
            // Unreachable while the pool holds a sender clone.
            None => break,
        }
    }
    pool.finish().await
}

impl Pool<'_> {
    fn spawn_worker(&mut self) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(worker_id, tx);
        self.idle.push(worker_id);
        self.tracker.spawn(worker_task(
            worker_id,
            Arc::clone(&self.factory),
            self.options.world_parameters.clone(),
            self.options.dry_run,
            self.emitter.clone(),
            rx,
            self.report_tx.clone(),
            self.shutdown.clone(),
        ));
        debug!(worker_id, "worker spawned");
    }

    /// Hand queued cases to idle workers while the predicate admits one.
    fn dispatch(&mut self) {
        while !self.halted && !self.idle.is_empty() && !self.queue.is_empty() {
            let in_flight: Vec<Arc<Pickle>> = self
                .in_flight
                .values()
                .map(|entry| Arc::clone(&entry.pickle))
                .collect();
            let position = self
                .queue
                .iter()
                .position(|(candidate, _)| self.library.can_assign(candidate, &in_flight));
            let position = match position {
                Some(position) => position,
                None if in_flight.is_empty() => {
                    // The predicate admits nothing even with no work in
                    // flight; forcing the front case avoids a stall.
                    warn!("assignment predicate rejected every queued case with none in flight; forcing the first");
                    0
                }
                None => break,
            };
            let Some((pickle, attempt)) = self.queue.remove(position) else {
                break;
            };
            let Some(worker_id) = self.idle.pop() else {
                break;
            };
            let case_started_id = self.ids.next_id();
            let command = WorkerCommand::Run {
                pickle: Arc::clone(&pickle),
                attempt,
                case_started_id,
            };
            self.in_flight.insert(
                worker_id,
                InFlight {
                    pickle,
                    attempt,
                    case_started_id,
                },
            );
            let delivered = self
                .senders
                .get(&worker_id)
                .is_some_and(|sender| sender.send(command).is_ok());
            if !delivered {
                // The worker died before its crash report arrived; that
                // report will settle this entry as a lost case.
                warn!(worker_id, "dispatched to a dead worker; awaiting its crash report");
            }
        }
    }

    fn on_case_finished(&mut self, worker_id: usize, outcome: AttemptOutcome) {
        self.idle.push(worker_id);
        let Some(entry) = self.in_flight.remove(&worker_id) else {
            warn!(worker_id, "finish report from a worker with no assigned case");
            return;
        };
        self.settle(entry, outcome.status, outcome.duration_ms, None);
    }

    fn on_worker_crashed(&mut self, worker_id: usize) {
        self.senders.remove(&worker_id);
        self.idle.retain(|&id| id != worker_id);
        if let Some(entry) = self.in_flight.remove(&worker_id) {
            warn!(worker_id, pickle_id = %entry.pickle.id, "worker lost; failing its in-flight case");
            self.settle(entry, Status::Failed, 0, Some("worker lost".to_owned()));
        }
        self.spawn_worker();
    }

    /// Emit `TestCaseFinished` and either requeue the case or record its
    /// final status.
    fn settle(&mut self, entry: InFlight, status: Status, duration_ms: u64, message: Option<String>) {
        // A retry is new dispatch, so a halted run settles every draining
        // case as final.
        let retrying =
            !self.halted && self.policy.should_retry(&entry.pickle, entry.attempt, status);
        self.emitter.emit(Envelope::TestCaseFinished {
            test_case_started_id: entry.case_started_id,
            status,
            will_be_retried: retrying,
            message,
            duration_ms,
            timestamp_ms: timestamp_ms(),
        });
        if retrying {
            self.queue.push_front((entry.pickle, entry.attempt + 1));
            return;
        }
        self.aggregate.record(status, self.options.strict);
        if self.options.fail_fast && status.is_failing(self.options.strict) && !self.halted {
            debug!("fail-fast triggered; dropping undispatched cases and draining in-flight work");
            self.halted = true;
            self.queue.clear();
        }
    }

    async fn finish(self) -> RunAggregate {
        for sender in self.senders.values() {
            let _ = sender.send(WorkerCommand::Shutdown);
        }
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.aggregate
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_task(
    worker_id: usize,
    factory: LibraryFactory,
    world_parameters: serde_json::Value,
    dry_run: bool,
    emitter: MessageEmitter,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    shutdown: CancellationToken,
) {
    // A factory panic must still produce a crash report, or the
    // coordinator would wait forever for this worker.
    let library = match std::panic::catch_unwind(AssertUnwindSafe(|| factory())) {
        Ok(library) => library,
        Err(_panic) => {
            error!(worker_id, "support code factory panicked; worker never started");
            let _ = reports.send(WorkerReport::Crashed { worker_id });
            return;
        }
    };
    let runner = LocalRunner::new(&library, &emitter, &world_parameters, dry_run, Some(worker_id));
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(WorkerCommand::Run { pickle, attempt, case_started_id }) => {
                    let attempt_fut = runner.run_case(&pickle, attempt, case_started_id);
                    match AssertUnwindSafe(attempt_fut).catch_unwind().await {
                        Ok(outcome) => {
                            let report = WorkerReport::CaseFinished { worker_id, outcome };
                            if reports.send(report).is_err() {
                                break;
                            }
                        }
                        Err(_panic) => {
                            error!(worker_id, pickle_id = %pickle.id, "worker crashed while executing a case");
                            let _ = reports.send(WorkerReport::Crashed { worker_id });
                            return;
                        }
                    }
                }
                Some(WorkerCommand::Shutdown) | None => break,
            },
        }
    }
    debug!(worker_id, "worker stopped");
}
