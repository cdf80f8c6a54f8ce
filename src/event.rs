//! Versioned message stream emitted by the runtime.
//!
//! Every observable fact about a run — run boundaries, per-attempt case
//! and step lifecycles, attachments — is reported as an [`Envelope`] on an
//! append-only channel consumed by formatters. Shapes are serde-stable;
//! consumers match on the `type` tag. In serial mode the stream order is
//! fully deterministic; with a worker pool, envelopes from different
//! workers interleave in real time while each case's own sequence stays
//! internally ordered.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::support::HookPhase;

/// Version of the message stream schema, reported on `TestRunStarted`.
///
/// Formatters pin against this, not the crate version; it only moves when
/// an envelope shape changes incompatibly.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Final status of a step, hook, or execution attempt.
///
/// The declaration order is the severity lattice used to aggregate a
/// case's status: the worst unit status wins, with `Ambiguous` and
/// `Undefined` jointly worst above `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Passed,
    Skipped,
    Pending,
    Failed,
    Ambiguous,
    Undefined,
}

impl Status {
    /// Whether this status fails a run.
    ///
    /// `Skipped` never fails; `Pending` and `Undefined` fail only under
    /// strict mode; `Failed` and `Ambiguous` always fail.
    #[must_use]
    pub fn is_failing(self, strict: bool) -> bool {
        match self {
            Self::Failed | Self::Ambiguous => true,
            Self::Pending | Self::Undefined => strict,
            Self::Passed | Self::Skipped => false,
        }
    }
}

/// Reference to the unit a step-level message concerns: a pickle step or
/// a hook invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitRef {
    Step { id: String },
    Hook { id: u64, phase: HookPhase },
}

/// Result payload carried by [`Envelope::TestStepFinished`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: Status,
    /// Failure or timeout description, when there is one.
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    #[must_use]
    pub fn new(status: Status, duration_ms: u64) -> Self {
        Self {
            status,
            message: None,
            duration_ms,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Attachment payload: log lines stay text, binary bodies stay bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentBody {
    Text(String),
    Binary(Vec<u8>),
}

/// One message on the run's output stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    TestRunStarted {
        protocol_version: String,
        timestamp_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    TestCaseStarted {
        /// Identifier tying all of this attempt's messages together.
        id: u64,
        pickle_id: String,
        /// 0-based attempt number; retries increment it.
        attempt: u32,
        /// Worker that ran the attempt; absent in serial mode.
        worker_id: Option<usize>,
        timestamp_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    TestStepStarted {
        test_case_started_id: u64,
        unit: UnitRef,
        timestamp_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    TestStepFinished {
        test_case_started_id: u64,
        unit: UnitRef,
        result: StepResult,
        timestamp_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Attachment {
        test_case_started_id: u64,
        unit: UnitRef,
        media_type: String,
        body: AttachmentBody,
    },
    #[serde(rename_all = "camelCase")]
    TestCaseFinished {
        test_case_started_id: u64,
        status: Status,
        /// True when the coordinator has decided to dispatch another
        /// attempt for this case.
        will_be_retried: bool,
        /// Case-level diagnostic, such as a lost worker; step-level
        /// failures carry their message on `TestStepFinished` instead.
        message: Option<String>,
        duration_ms: u64,
        timestamp_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    TestRunFinished { success: bool, timestamp_ms: u64 },
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Monotonic generator for `TestCaseStarted` identifiers, shared across
/// workers so every attempt in a run gets a distinct id.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn next_id(&self) -> u64 { self.next.fetch_add(1, Ordering::Relaxed) }
}

/// Cloneable producer side of the message stream.
///
/// Emission never blocks and never fails: if the consumer has gone away
/// the envelope is dropped, since formatters are observers and must not
/// stall execution.
#[derive(Clone, Debug)]
pub struct MessageEmitter {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MessageEmitter {
    /// Create an emitter and the receiver formatters will consume.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            tracing::debug!("message stream receiver dropped; envelope discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_lattice_orders_worst_last() {
        assert!(Status::Passed < Status::Skipped);
        assert!(Status::Skipped < Status::Pending);
        assert!(Status::Pending < Status::Failed);
        assert!(Status::Failed < Status::Ambiguous);
        assert!(Status::Ambiguous < Status::Undefined);
    }

    #[test]
    fn failing_statuses_respect_strictness() {
        for status in [Status::Failed, Status::Ambiguous] {
            assert!(status.is_failing(false));
            assert!(status.is_failing(true));
        }
        for status in [Status::Pending, Status::Undefined] {
            assert!(!status.is_failing(false));
            assert!(status.is_failing(true));
        }
        for status in [Status::Passed, Status::Skipped] {
            assert!(!status.is_failing(false));
            assert!(!status.is_failing(true));
        }
    }

    #[test]
    fn id_generator_is_monotonic() {
        let ids = IdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
    }

    #[test]
    fn envelopes_serialize_with_a_type_tag() {
        let envelope = Envelope::TestRunFinished {
            success: true,
            timestamp_ms: 0,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "testRunFinished");
        assert_eq!(json["success"], true);
    }

    #[test]
    fn emit_after_receiver_drop_is_silent() {
        let (emitter, rx) = MessageEmitter::channel();
        drop(rx);
        emitter.emit(Envelope::TestRunStarted {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            timestamp_ms: 0,
        });
    }
}
