#![doc(html_root_url = "https://docs.rs/cornichon/latest")]
//! Public API for the `cornichon` library.
//!
//! This crate provides the execution runtime for compiled behaviour
//! tests: step matching, hook sequencing, timeouts, retries, and serial
//! or worker-pool execution, all reported on a versioned message stream.

pub mod event;
mod executor;
pub mod expression;
pub mod matcher;
pub mod param;
pub mod pickle;
pub mod runner;
pub mod sink;
pub mod support;
pub mod tags;

pub use event::{
    Envelope,
    IdGenerator,
    MessageEmitter,
    PROTOCOL_VERSION,
    Status,
    StepResult,
    UnitRef,
};
pub use pickle::{Location, Pickle, PickleStep, StepArgument, StepKeyword};
pub use runner::{LibraryFactory, RunError, RunOptions, Runtime};
pub use sink::AttachmentSink;
pub use support::{
    HandlerError,
    HandlerResult,
    HookContext,
    HookHandler,
    HookPhase,
    StepContext,
    StepHandler,
    SupportCodeBuilder,
    SupportCodeLibrary,
    World,
    WorldHandle,
};
pub use tags::TagExpression;
