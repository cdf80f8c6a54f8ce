//! Serial execution adapter.
//!
//! [`LocalRunner`] runs one attempt at a time on the caller's task. It is
//! also the unit of work inside each pool worker, so the pool and the
//! serial path share the same per-attempt behaviour by construction.

use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    CaseRunner,
    RunOptions,
    policy::{RetryPolicy, RunAggregate},
};
use crate::{
    event::{Envelope, IdGenerator, MessageEmitter, Status, timestamp_ms},
    executor::{AttemptOutcome, CaseExecutor},
    pickle::Pickle,
    support::SupportCodeLibrary,
};

/// Runs attempts in the current task against a borrowed library.
pub(crate) struct LocalRunner<'a> {
    executor: CaseExecutor<'a>,
    emitter: &'a MessageEmitter,
    worker_id: Option<usize>,
}

impl<'a> LocalRunner<'a> {
    pub(crate) fn new(
        library: &'a SupportCodeLibrary,
        emitter: &'a MessageEmitter,
        world_parameters: &'a Value,
        dry_run: bool,
        worker_id: Option<usize>,
    ) -> Self {
        Self {
            executor: CaseExecutor::new(library, emitter, world_parameters, dry_run),
            emitter,
            worker_id,
        }
    }
}

#[async_trait]
impl CaseRunner for LocalRunner<'_> {
    async fn run_case(&self, pickle: &Pickle, attempt: u32, case_started_id: u64) -> AttemptOutcome {
        self.emitter.emit(Envelope::TestCaseStarted {
            id: case_started_id,
            pickle_id: pickle.id.clone(),
            attempt,
            worker_id: self.worker_id,
            timestamp_ms: timestamp_ms(),
        });
        self.executor.execute(pickle, case_started_id).await
    }
}

/// Run every case in order on the current task.
///
/// Panics escaping the executor (a world constructor, typically) are
/// contained here and fail the attempt, which then goes through the
/// ordinary retry decision.
pub(crate) async fn run_serial(
    library: &SupportCodeLibrary,
    options: &RunOptions,
    policy: &RetryPolicy,
    pickles: &[Arc<Pickle>],
    emitter: &MessageEmitter,
    ids: &Arc<IdGenerator>,
) -> RunAggregate {
    let runner = LocalRunner::new(library, emitter, &options.world_parameters, options.dry_run, None);
    let runner: &dyn CaseRunner = &runner;
    let mut aggregate = RunAggregate::default();
    'cases: for pickle in pickles {
        let mut attempt = 0u32;
        loop {
            let case_started_id = ids.next_id();
            let attempt_fut = runner.run_case(pickle, attempt, case_started_id);
            let outcome = match AssertUnwindSafe(attempt_fut).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_panic) => {
                    warn!(pickle_id = %pickle.id, "case execution panicked outside handler code");
                    AttemptOutcome {
                        status: Status::Failed,
                        duration_ms: 0,
                    }
                }
            };
            let retrying = policy.should_retry(pickle, attempt, outcome.status);
            emitter.emit(Envelope::TestCaseFinished {
                test_case_started_id: case_started_id,
                status: outcome.status,
                will_be_retried: retrying,
                message: None,
                duration_ms: outcome.duration_ms,
                timestamp_ms: timestamp_ms(),
            });
            if retrying {
                attempt += 1;
                continue;
            }
            aggregate.record(outcome.status, options.strict);
            if options.fail_fast && outcome.status.is_failing(options.strict) {
                debug!(pickle_id = %pickle.id, "fail-fast triggered; remaining cases are not dispatched");
                break 'cases;
            }
            break;
        }
    }
    aggregate
}
