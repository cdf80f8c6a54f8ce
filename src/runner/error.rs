//! Errors raised by [`crate::runner::Runtime`] preconditions.
//!
//! Nothing originating inside a handler or a worker ever propagates out
//! of a run; execution failures are represented as statuses on the
//! message stream. These errors cover the only other possibility:
//! refusing to start at all.

use thiserror::Error;

/// Precondition violations detected before any test case runs.
#[derive(Debug, Error)]
pub enum RunError {
    /// Non-empty case list but a support library with no definitions.
    #[error("support code library is empty but {0} test case(s) were supplied")]
    EmptySupportCode(usize),
    /// The run options are inconsistent.
    #[error("invalid run options: {0}")]
    InvalidOptions(String),
}
