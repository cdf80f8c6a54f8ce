//! Per-attempt test case execution.
//!
//! [`CaseExecutor`] runs one execution attempt of one pickle to
//! completion: before-case hooks, each step wrapped by its step hooks,
//! then after-case hooks, honouring timeouts and the skip-on-failure
//! rule. The attempt's final status is the worst unit status encountered
//! under the [`Status`] severity lattice. There is no cancelled state:
//! cancellation shows up as every remaining unit resolving to `Skipped`.
//!
//! Timeout caveat: a timeout stops *waiting* for a handler, it does not
//! forcibly terminate it. The handler future is dropped at its next
//! suspension point, but background tasks it spawned keep running;
//! handler code must guard against leaking such work.


use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    event::{Envelope, MessageEmitter, Status, StepResult, UnitRef, timestamp_ms},
    matcher::{MatchOutcome, match_step},
    pickle::{Pickle, PickleStep},
    sink::{AttachmentSink, SinkItem},
    support::{
        HandlerError,
        HandlerResult,
        HookContext,
        HookDef,
        HookPhase,
        StepContext,
        SupportCodeLibrary,
        World,
        WorldHandle,
    },
};

/// Phases of one execution attempt, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    NotStarted,
    RunningBeforeHooks,
    RunningSteps,
    RunningAfterHooks,
    Finished,
}

impl Phase {
    pub(crate) fn advance(self) -> Self {
        match self {
            Self::NotStarted => Self::RunningBeforeHooks,
            Self::RunningBeforeHooks => Self::RunningSteps,
            Self::RunningSteps => Self::RunningAfterHooks,
            Self::RunningAfterHooks | Self::Finished => Self::Finished,
        }
    }
}

/// Result of one execution attempt.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AttemptOutcome {
    pub status: Status,
    pub duration_ms: u64,
}

/// Runs single execution attempts against a frozen support library.
pub(crate) struct CaseExecutor<'a> {
    library: &'a SupportCodeLibrary,
    emitter: &'a MessageEmitter,
    world_parameters: &'a Value,
    dry_run: bool,
}

struct AttemptState {
    phase: Phase,
    worst: Status,
    world: WorldHandle,
    sink: AttachmentSink,
}

impl AttemptState {
    /// Prior failures (or pending/undefined/ambiguous units) flag the
    /// case so that later steps resolve as skipped without invocation.
    fn skip_remaining(&self) -> bool { self.worst >= Status::Pending }

    fn record(&mut self, status: Status) { self.worst = self.worst.max(status); }

    fn advance(&mut self) { self.phase = self.phase.advance(); }
}

impl<'a> CaseExecutor<'a> {
    pub(crate) fn new(
        library: &'a SupportCodeLibrary,
        emitter: &'a MessageEmitter,
        world_parameters: &'a Value,
        dry_run: bool,
    ) -> Self {
        Self {
            library,
            emitter,
            world_parameters,
            dry_run,
        }
    }

    /// Run one attempt of `pickle` to completion.
    ///
    /// Step and hook envelopes are emitted as they happen, all tagged
    /// with `case_started_id`; the caller owns the surrounding
    /// case-started/case-finished pair.
    pub(crate) async fn execute(&self, pickle: &Pickle, case_started_id: u64) -> AttemptOutcome {
        let started = Instant::now();
        let world = if self.dry_run {
            World::new(())
        } else {
            self.library.make_world(self.world_parameters)
        };
        let mut state = AttemptState {
            phase: Phase::NotStarted,
            worst: Status::Passed,
            world: WorldHandle::new(world),
            sink: AttachmentSink::new(),
        };

        state.advance();
        debug_assert_eq!(state.phase, Phase::RunningBeforeHooks);
        // Every before-case hook runs even after a failure, so handlers
        // can still register state that after-case cleanup relies on.
        for hook in self.applicable(HookPhase::BeforeCase, pickle) {
            let status = self.run_hook(hook, pickle, &mut state, case_started_id).await;
            state.record(status);
        }

        state.advance();
        for step in &pickle.steps {
            self.run_step(step, pickle, &mut state, case_started_id).await;
        }

        state.advance();
        // After-case hooks always run, in reverse registration order, so
        // cleanup executes no matter how earlier phases ended.
        for hook in self.applicable(HookPhase::AfterCase, pickle).into_iter().rev() {
            let status = self.run_hook(hook, pickle, &mut state, case_started_id).await;
            state.record(status);
        }

        state.advance();
        debug_assert_eq!(state.phase, Phase::Finished);
        AttemptOutcome {
            status: state.worst,
            duration_ms: duration_ms(started),
        }
    }

    fn applicable(&self, phase: HookPhase, pickle: &Pickle) -> Vec<&'a HookDef> {
        self.library
            .hooks(phase)
            .iter()
            .filter(|hook| hook.applies_to(&pickle.tags))
            .collect()
    }

    async fn run_step(
        &self,
        step: &PickleStep,
        pickle: &Pickle,
        state: &mut AttemptState,
        case_started_id: u64,
    ) {
        let unit = UnitRef::Step {
            id: step.id.clone(),
        };
        if state.skip_remaining() {
            // Flagged case: the step resolves skipped without invocation
            // and without its surrounding step hooks.
            self.emit_started(case_started_id, &unit);
            self.emit_finished(case_started_id, &unit, StepResult::new(Status::Skipped, 0));
            return;
        }

        let mut step_flagged = false;
        for hook in self.applicable(HookPhase::BeforeStep, pickle) {
            let status = self.run_hook(hook, pickle, state, case_started_id).await;
            if status > Status::Skipped {
                step_flagged = true;
            }
            state.record(status);
        }

        let status = self
            .resolve_and_invoke(step, state, step_flagged, case_started_id)
            .await;
        state.record(status);

        for hook in self.applicable(HookPhase::AfterStep, pickle).into_iter().rev() {
            let status = self.run_hook(hook, pickle, state, case_started_id).await;
            state.record(status);
        }
    }

    async fn resolve_and_invoke(
        &self,
        step: &PickleStep,
        state: &mut AttemptState,
        step_flagged: bool,
        case_started_id: u64,
    ) -> Status {
        let unit = UnitRef::Step {
            id: step.id.clone(),
        };
        self.emit_started(case_started_id, &unit);
        let started = Instant::now();

        let result = match match_step(self.library, &step.text) {
            MatchOutcome::Undefined => StepResult::new(Status::Undefined, 0)
                .with_message(format!("undefined step: {:?}", step.text)),
            MatchOutcome::Ambiguous(ids) => {
                let patterns: Vec<String> = self
                    .library
                    .steps()
                    .iter()
                    .filter(|def| ids.contains(&def.id()))
                    .map(|def| format!("{:?}", def.expression().source()))
                    .collect();
                StepResult::new(Status::Ambiguous, 0).with_message(format!(
                    "step {:?} matches multiple definitions: {}",
                    step.text,
                    patterns.join(", ")
                ))
            }
            MatchOutcome::Matched(_) if self.dry_run => StepResult::new(Status::Passed, 0),
            MatchOutcome::Matched(_) if step_flagged => StepResult::new(Status::Skipped, 0),
            MatchOutcome::Matched(matched) => match matched.args {
                Err(transform_error) => {
                    StepResult::new(Status::Failed, duration_ms(started))
                        .with_message(transform_error.to_string())
                }
                Ok(args) => {
                    let def = &self.library.steps()[matched.def_index];
                    let timeout = def.timeout().unwrap_or(self.library.default_timeout());
                    state.sink.set_active(Some(unit.clone()));
                    let context = StepContext {
                        world: state.world.clone(),
                        args,
                        argument: step.argument.clone(),
                        sink: state.sink.clone(),
                    };
                    let invocation = (def.handler())(context);
                    let (status, message) = self.invoke(invocation, timeout).await;
                    state.sink.set_active(None);
                    let mut result = StepResult::new(status, duration_ms(started));
                    if let Some(message) = message {
                        result = result.with_message(message);
                    }
                    result
                }
            },
        };

        self.flush_attachments(case_started_id, &unit, &state.sink);
        let status = result.status;
        self.emit_finished(case_started_id, &unit, result);
        status
    }

    async fn run_hook(
        &self,
        hook: &HookDef,
        pickle: &Pickle,
        state: &mut AttemptState,
        case_started_id: u64,
    ) -> Status {
        let unit = UnitRef::Hook {
            id: hook.id(),
            phase: hook.phase(),
        };
        self.emit_started(case_started_id, &unit);
        if self.dry_run {
            self.emit_finished(case_started_id, &unit, StepResult::new(Status::Skipped, 0));
            return Status::Skipped;
        }

        let started = Instant::now();
        let timeout = hook.timeout().unwrap_or(self.library.default_timeout());
        state.sink.set_active(Some(unit.clone()));
        let context = HookContext {
            world: state.world.clone(),
            tags: pickle.tags.clone(),
            sink: state.sink.clone(),
        };
        let invocation = (hook.handler())(context);
        let (status, message) = self.invoke(invocation, timeout).await;
        state.sink.set_active(None);

        self.flush_attachments(case_started_id, &unit, &state.sink);
        let mut result = StepResult::new(status, duration_ms(started));
        if let Some(message) = message {
            result = result.with_message(message);
        }
        self.emit_finished(case_started_id, &unit, result);
        status
    }

    /// Await a handler under its timeout, mapping panics, the pending
    /// signal and timeouts onto statuses.
    async fn invoke(
        &self,
        invocation: futures::future::BoxFuture<'static, HandlerResult>,
        timeout: Duration,
    ) -> (Status, Option<String>) {
        let guarded = AssertUnwindSafe(invocation).catch_unwind();
        match tokio::time::timeout(timeout, guarded).await {
            Err(_elapsed) => {
                debug!(timeout_ms = timeout.as_millis(), "handler timed out; abandoning it");
                (
                    Status::Failed,
                    Some(format!(
                        "handler timed out after {}ms; it was abandoned, not terminated",
                        timeout.as_millis()
                    )),
                )
            }
            Ok(Err(panic)) => (Status::Failed, Some(panic_message(panic.as_ref()))),
            Ok(Ok(Ok(()))) => (Status::Passed, None),
            Ok(Ok(Err(HandlerError::Pending))) => {
                (Status::Pending, Some("pending".to_owned()))
            }
            Ok(Ok(Err(HandlerError::Failure(message)))) => (Status::Failed, Some(message)),
        }
    }

    fn flush_attachments(&self, case_started_id: u64, unit: &UnitRef, sink: &AttachmentSink) {
        for item in sink.drain(unit) {
            let envelope = match item {
                SinkItem::Log { text } => Envelope::Attachment {
                    test_case_started_id: case_started_id,
                    unit: unit.clone(),
                    media_type: crate::sink::LOG_MEDIA_TYPE.to_owned(),
                    body: crate::event::AttachmentBody::Text(text),
                },
                SinkItem::Attachment { media_type, body } => Envelope::Attachment {
                    test_case_started_id: case_started_id,
                    unit: unit.clone(),
                    media_type,
                    body: crate::event::AttachmentBody::Binary(body),
                },
            };
            self.emitter.emit(envelope);
        }
    }

    fn emit_started(&self, case_started_id: u64, unit: &UnitRef) {
        self.emitter.emit(Envelope::TestStepStarted {
            test_case_started_id: case_started_id,
            unit: unit.clone(),
            timestamp_ms: timestamp_ms(),
        });
    }

    fn emit_finished(&self, case_started_id: u64, unit: &UnitRef, result: StepResult) {
        self.emitter.emit(Envelope::TestStepFinished {
            test_case_started_id: case_started_id,
            unit: unit.clone(),
            result,
            timestamp_ms: timestamp_ms(),
        });
    }
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
        .to_owned()
}
