//! Shared utilities for integration tests.
//!
//! Provides handler constructors, pickle builders, and envelope
//! extraction helpers so individual test modules stay focused on the
//! behaviour under test.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use cornichon::{
    Envelope,
    HandlerError,
    Pickle,
    PickleStep,
    Status,
    StepHandler,
    StepKeyword,
};
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedReceiver;

/// Install a test-writer subscriber once per binary; later calls no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Build a pickle whose steps carry ids `<id>-s0`, `<id>-s1`, and so on.
pub fn pickle(id: &str, texts: &[&str]) -> Arc<Pickle> {
    let steps = texts
        .iter()
        .enumerate()
        .map(|(i, text)| PickleStep::new(format!("{id}-s{i}"), StepKeyword::Action, *text))
        .collect();
    Arc::new(Pickle::new(id, id, steps))
}

/// Build a tagged pickle, steps as in [`pickle`].
pub fn pickle_tagged(id: &str, texts: &[&str], tags: &[&str]) -> Arc<Pickle> {
    let steps = texts
        .iter()
        .enumerate()
        .map(|(i, text)| PickleStep::new(format!("{id}-s{i}"), StepKeyword::Action, *text))
        .collect();
    Arc::new(Pickle::new(id, id, steps).with_tags(tags.iter().copied()))
}

/// Handler that passes and counts its invocations.
pub fn counting_step(calls: Arc<AtomicU32>) -> StepHandler {
    Arc::new(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }.boxed()
    })
}

/// Handler that always fails with the given description.
pub fn failing_step(message: &str) -> StepHandler {
    let message = message.to_owned();
    Arc::new(move |_| {
        let message = message.clone();
        async move { Err(HandlerError::failure(message)) }.boxed()
    })
}

/// Handler that fails until it has been invoked `threshold` times.
pub fn step_passing_after(threshold: u32, calls: Arc<AtomicU32>) -> StepHandler {
    Arc::new(move |_| {
        let invocation = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if invocation >= threshold {
            async { Ok(()) }.boxed()
        } else {
            async { Err(HandlerError::failure("not yet")) }.boxed()
        }
    })
}

/// Collect every envelope currently buffered on the stream.
pub fn drain(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Envelope> {
    let mut envelopes = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        envelopes.push(envelope);
    }
    envelopes
}

/// Pickle ids of every `TestCaseStarted` envelope, in stream order.
pub fn started_pickle_ids(envelopes: &[Envelope]) -> Vec<String> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::TestCaseStarted { pickle_id, .. } => Some(pickle_id.clone()),
            _ => None,
        })
        .collect()
}

/// `(status, will_be_retried)` of every `TestCaseFinished`, in stream order.
pub fn finished_cases(envelopes: &[Envelope]) -> Vec<(Status, bool)> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::TestCaseFinished {
                status,
                will_be_retried,
                ..
            } => Some((*status, *will_be_retried)),
            _ => None,
        })
        .collect()
}

/// Step statuses from `TestStepFinished` envelopes, in stream order.
pub fn step_statuses(envelopes: &[Envelope]) -> Vec<Status> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::TestStepFinished { result, .. } => Some(result.status),
            _ => None,
        })
        .collect()
}
