//! Retry policy and run-level aggregation shared by both adapters.
//!
//! Serial and worker-pool execution must agree exactly on when a failed
//! attempt earns another try and on what the run's overall success flag
//! means, so both decisions live here.

use std::collections::BTreeMap;

use crate::{event::Status, pickle::Pickle, tags::TagExpression};

/// Decides whether a finished attempt gets another try.
#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    budget: u32,
    filter: Option<TagExpression>,
}

impl RetryPolicy {
    pub(crate) fn new(budget: u32, filter: Option<TagExpression>) -> Self {
        Self { budget, filter }
    }

    /// True when `attempt` (0-based) failed, budget remains, and the
    /// case's tags pass the optional retry filter.
    ///
    /// Only `Failed` retries: undefined, ambiguous and pending outcomes
    /// are definitional and another attempt cannot change them.
    pub(crate) fn should_retry(&self, pickle: &Pickle, attempt: u32, status: Status) -> bool {
        status == Status::Failed
            && attempt < self.budget
            && self.filter.as_ref().is_none_or(|f| f.evaluate(&pickle.tags))
    }
}

/// Overall success flag and per-status counts, owned by the coordinator.
///
/// Only each case's *last* attempt is recorded; intermediate attempts
/// are reported on the message stream but do not influence the verdict.
#[derive(Debug, Default)]
pub(crate) struct RunAggregate {
    counts: BTreeMap<Status, usize>,
    any_failing: bool,
}

impl RunAggregate {
    pub(crate) fn record(&mut self, status: Status, strict: bool) {
        *self.counts.entry(status).or_insert(0) += 1;
        if status.is_failing(strict) {
            self.any_failing = true;
        }
    }

    pub(crate) fn success(&self) -> bool { !self.any_failing }

    pub(crate) fn counts(&self) -> &BTreeMap<Status, usize> { &self.counts }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pickle() -> Pickle { Pickle::new("p", "case", Vec::new()) }

    fn flaky_pickle() -> Pickle {
        Pickle::new("p", "case", Vec::new()).with_tags(["@flaky"])
    }

    #[test]
    fn retries_only_failed_within_budget() {
        let policy = RetryPolicy::new(2, None);
        assert!(policy.should_retry(&pickle(), 0, Status::Failed));
        assert!(policy.should_retry(&pickle(), 1, Status::Failed));
        assert!(!policy.should_retry(&pickle(), 2, Status::Failed));
        for status in [Status::Undefined, Status::Ambiguous, Status::Pending, Status::Passed] {
            assert!(!policy.should_retry(&pickle(), 0, status));
        }
    }

    #[test]
    fn retry_filter_scopes_to_matching_tags() {
        let filter = TagExpression::parse("@flaky").unwrap();
        let policy = RetryPolicy::new(1, Some(filter));
        assert!(policy.should_retry(&flaky_pickle(), 0, Status::Failed));
        assert!(!policy.should_retry(&pickle(), 0, Status::Failed));
    }

    #[test]
    fn aggregate_success_tracks_failing_statuses() {
        let mut aggregate = RunAggregate::default();
        aggregate.record(Status::Passed, false);
        aggregate.record(Status::Skipped, false);
        assert!(aggregate.success());
        aggregate.record(Status::Failed, false);
        assert!(!aggregate.success());
    }

    #[test]
    fn pending_and_undefined_fail_only_under_strict() {
        for status in [Status::Pending, Status::Undefined] {
            let mut lax = RunAggregate::default();
            lax.record(status, false);
            assert!(lax.success());

            let mut strict = RunAggregate::default();
            strict.record(status, true);
            assert!(!strict.success());
        }
    }

    #[test]
    fn counts_accumulate_per_status() {
        let mut aggregate = RunAggregate::default();
        aggregate.record(Status::Passed, false);
        aggregate.record(Status::Passed, false);
        aggregate.record(Status::Failed, false);
        assert_eq!(aggregate.counts().get(&Status::Passed), Some(&2));
        assert_eq!(aggregate.counts().get(&Status::Failed), Some(&1));
    }
}
