//! Error taxonomy for building and running flows.

use std::fmt;

use thiserror::Error;

/// Errors detected while building a [`FlowGraph`](crate::FlowGraph).
///
/// All of these are reported before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("step id cannot be empty")]
    EmptyStepId,

    #[error("duplicate step id `{0}`")]
    DuplicateStepId(String),

    #[error("step `{step}` references unknown step `{reference}`")]
    DanglingReference { step: String, reference: String },

    #[error("step `{step}` references `{reference}`, which has not completed before it")]
    OutOfOrderReference { step: String, reference: String },

    #[error("step `{step}` references `{reference}` from a sibling branch of `{node}`")]
    CrossBranchReference {
        step: String,
        reference: String,
        node: String,
    },

    #[error("branchone step `{0}` has no branches and no default")]
    UnreachableBranch(String),

    #[error("malformed expression in step `{step}` ({location}): {message}")]
    MalformedExpression {
        step: String,
        location: String,
        message: String,
    },

    #[error("static input `{input}` of step `{step}` is not of type {expected}")]
    StaticTypeMismatch {
        step: String,
        input: String,
        expected: String,
    },
}

/// Errors raised while resolving an expression during a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("unknown flow input `{0}`")]
    UnknownInput(String),

    /// A referenced step has neither produced a result nor been skipped.
    /// Graph validation rules this out, so it always indicates an engine bug.
    #[error("result of step `{0}` is not available yet")]
    UnresolvedDependency(String),

    #[error("template rendering failed: {0}")]
    Template(String),
}

/// A reference expression or template that does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

impl From<String> for ParseError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ParseError {
    fn from(message: &str) -> Self {
        Self::from(message.to_string())
    }
}

/// Failure signalled by a leaf body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LeafFailure {
    pub message: String,
}

impl LeafFailure {
    /// Create a failure with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for LeafFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Errors raised when a raw flow input does not satisfy the flow schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("missing required input `{0}`")]
    MissingRequired(String),

    #[error("input `{name}` must be of type {expected}")]
    TypeMismatch { name: String, expected: String },

    #[error("input `{0}` is not one of the allowed values")]
    NotInEnum(String),

    #[error("invalid input schema: {0}")]
    InvalidSchema(String),
}

/// What made a step fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Leaf(#[from] LeafFailure),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

impl FailureCause {
    /// Whether a failure policy may absorb this cause.
    pub fn is_tolerable(&self) -> bool {
        !matches!(
            self,
            FailureCause::Evaluation(EvaluationError::UnresolvedDependency(_))
        )
    }
}

/// A failure originating at one step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step `{step_id}` failed: {cause}")]
pub struct StepFailure {
    /// Id of the step the failure originated at.
    pub step_id: String,

    /// Ids of the steps the failure travelled through, innermost first.
    pub path: Vec<String>,

    pub cause: FailureCause,
}

impl StepFailure {
    /// Create a failure at `step_id`.
    pub fn new(step_id: &str, cause: impl Into<FailureCause>) -> Self {
        Self {
            step_id: step_id.to_string(),
            path: vec![step_id.to_string()],
            cause: cause.into(),
        }
    }
}

/// One or more step failures surfaced together.
///
/// Concurrent branches may fail independently, so a single node can
/// report several failures at once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregateFailure {
    pub failures: Vec<StepFailure>,
}

impl AggregateFailure {
    /// Wrap a single failure.
    pub fn single(failure: StepFailure) -> Self {
        Self {
            failures: vec![failure],
        }
    }

    /// Append the failures of another aggregate.
    pub fn merge(&mut self, other: AggregateFailure) {
        self.failures.extend(other.failures);
    }

    /// Record that the failure passed through `step_id`.
    pub fn through(mut self, step_id: &str) -> Self {
        for failure in &mut self.failures {
            if failure.path.last().map(String::as_str) != Some(step_id) {
                failure.path.push(step_id.to_string());
            }
        }
        self
    }

    /// Whether every failure may be absorbed by a policy.
    pub fn is_tolerable(&self) -> bool {
        self.failures.iter().all(|f| f.cause.is_tolerable())
    }

    /// Id of the first originating step.
    pub fn first_step(&self) -> Option<&str> {
        self.failures.first().map(|f| f.step_id.as_str())
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failures.as_slice() {
            [] => write!(f, "no failures"),
            [only] => write!(f, "{only}"),
            many => {
                write!(f, "{} steps failed", many.len())?;
                for failure in many {
                    write!(f, "; {failure}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AggregateFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_dependency_is_never_tolerable() {
        let cause = FailureCause::from(EvaluationError::UnresolvedDependency("a".into()));
        assert!(!cause.is_tolerable());

        let cause = FailureCause::from(EvaluationError::UnknownInput("x".into()));
        assert!(cause.is_tolerable());

        let cause = FailureCause::from(LeafFailure::new("boom"));
        assert!(cause.is_tolerable());
    }

    #[test]
    fn test_aggregate_path_tracking() {
        let failure = AggregateFailure::single(StepFailure::new("leaf", LeafFailure::new("boom")))
            .through("leaf")
            .through("group")
            .through("root");

        assert_eq!(failure.failures[0].path, vec!["leaf", "group", "root"]);
        assert_eq!(failure.first_step(), Some("leaf"));
    }

    #[test]
    fn test_aggregate_display() {
        let mut failure = AggregateFailure::single(StepFailure::new("a", LeafFailure::new("x")));
        assert_eq!(failure.to_string(), "step `a` failed: x");

        failure.merge(AggregateFailure::single(StepFailure::new(
            "b",
            LeafFailure::new("y"),
        )));
        assert!(failure.to_string().starts_with("2 steps failed"));
    }
}
