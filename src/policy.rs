//! Failure policy: whether a failure aborts the run or is absorbed.

use crate::error::{AggregateFailure, StepFailure};

/// Static failure configuration attached to a step or a branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Set on steps.
    pub continue_on_error: bool,

    /// Set on branches.
    pub skip_failure: bool,
}

impl FailurePolicy {
    /// Policy of a step.
    pub fn for_step(continue_on_error: bool) -> Self {
        Self {
            continue_on_error,
            skip_failure: false,
        }
    }

    /// Policy of a branch.
    pub fn for_branch(skip_failure: bool) -> Self {
        Self {
            continue_on_error: false,
            skip_failure,
        }
    }

    /// Whether the policy opts in to absorbing failures at all.
    pub fn absorbs(&self) -> bool {
        self.continue_on_error || self.skip_failure
    }

    /// Whether this failure should be recorded and the run continued.
    ///
    /// Unresolved dependencies are never tolerated.
    pub fn should_tolerate(&self, failure: &StepFailure) -> bool {
        self.absorbs() && failure.cause.is_tolerable()
    }

    /// Whether every failure of an aggregate should be tolerated.
    pub fn should_tolerate_all(&self, failure: &AggregateFailure) -> bool {
        !failure.failures.is_empty() && failure.failures.iter().all(|f| self.should_tolerate(f))
    }
}
