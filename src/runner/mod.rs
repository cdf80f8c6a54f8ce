//! Run coordination: options, retry policy, and the serial and pooled
//! execution adapters.
//!
//! [`Runtime`] is the embedding application's entry point. It validates
//! the run options up front, picks the adapter (`parallel == 0` selects
//! serial execution), and owns the run-level envelope pair on the
//! message stream. Everything below it reports through statuses; the
//! only errors a caller ever sees are precondition failures.

mod error;
mod local;
mod policy;
mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

pub use self::error::RunError;
use self::policy::RetryPolicy;
use crate::{
    event::{Envelope, IdGenerator, MessageEmitter, PROTOCOL_VERSION, timestamp_ms},
    executor::AttemptOutcome,
    pickle::Pickle,
    support::SupportCodeLibrary,
    tags::TagExpression,
};

/// Factory producing a fresh support library snapshot.
///
/// A serial run builds one; each pool worker builds its own so handler
/// state never crosses worker boundaries.
pub type LibraryFactory = Arc<dyn Fn() -> SupportCodeLibrary + Send + Sync>;

/// Options controlling one run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Resolve and report every case without invoking handler code.
    pub dry_run: bool,
    /// Stop dispatching new cases after the first failing one.
    pub fail_fast: bool,
    /// Worker count; `0` selects the serial adapter.
    pub parallel: usize,
    /// Extra attempts granted to failed cases.
    pub retry: u32,
    /// Restrict retries to cases matching this tag expression.
    pub retry_tag_filter: Option<String>,
    /// Fail the run on pending or undefined outcomes.
    pub strict: bool,
    /// Opaque value handed to the world constructor of every attempt.
    pub world_parameters: Value,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            fail_fast: false,
            parallel: 0,
            retry: 0,
            retry_tag_filter: None,
            strict: false,
            world_parameters: Value::Null,
        }
    }
}

/// Seam between the coordinator and whatever executes a single attempt.
#[async_trait]
pub(crate) trait CaseRunner: Send + Sync {
    /// Emit `TestCaseStarted` and run one attempt to completion.
    ///
    /// The surrounding `TestCaseFinished` stays with the coordinator,
    /// which alone knows whether the attempt will be retried.
    async fn run_case(&self, pickle: &Pickle, attempt: u32, case_started_id: u64)
    -> AttemptOutcome;
}

/// Entry point for executing a batch of compiled test cases.
pub struct Runtime {
    options: RunOptions,
    retry_filter: Option<TagExpression>,
    factory: LibraryFactory,
}

impl Runtime {
    /// Validate `options` and bind the support code factory.
    ///
    /// # Errors
    ///
    /// [`RunError::InvalidOptions`] when a retry tag filter is supplied
    /// with a zero retry budget, or when the filter does not parse.
    pub fn new(options: RunOptions, factory: LibraryFactory) -> Result<Self, RunError> {
        if options.retry == 0 && options.retry_tag_filter.is_some() {
            return Err(RunError::InvalidOptions(
                "a retry tag filter requires a non-zero retry budget".to_owned(),
            ));
        }
        let retry_filter = options
            .retry_tag_filter
            .as_deref()
            .map(TagExpression::parse)
            .transpose()
            .map_err(|e| RunError::InvalidOptions(e.to_string()))?;
        Ok(Self {
            options,
            retry_filter,
            factory,
        })
    }

    /// Execute `pickles`, streaming envelopes to `emitter`.
    ///
    /// Returns the run's overall success flag, which also appears on the
    /// final `TestRunFinished` envelope. A dry run reports resolution
    /// problems on the stream but always returns success.
    ///
    /// # Errors
    ///
    /// [`RunError::EmptySupportCode`] when cases were supplied but the
    /// factory produced a library with no definitions at all.
    pub async fn run(
        &self,
        pickles: &[Arc<Pickle>],
        emitter: &MessageEmitter,
    ) -> Result<bool, RunError> {
        let library = (self.factory)();
        if library.is_empty() && !pickles.is_empty() {
            return Err(RunError::EmptySupportCode(pickles.len()));
        }

        emitter.emit(Envelope::TestRunStarted {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            timestamp_ms: timestamp_ms(),
        });
        let ids = IdGenerator::new();
        let policy = RetryPolicy::new(self.options.retry, self.retry_filter.clone());
        let aggregate = if self.options.parallel == 0 {
            local::run_serial(&library, &self.options, &policy, pickles, emitter, &ids).await
        } else {
            pool::run_pool(
                Arc::clone(&self.factory),
                &library,
                &self.options,
                &policy,
                pickles,
                emitter,
                &ids,
            )
            .await
        };

        let success = self.options.dry_run || aggregate.success();
        info!(success, counts = ?aggregate.counts(), "run finished");
        emitter.emit(Envelope::TestRunFinished {
            success,
            timestamp_ms: timestamp_ms(),
        });
        Ok(success)
    }
}
