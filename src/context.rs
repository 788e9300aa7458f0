//! Run-scoped state: the flow input and the results of completed steps.

use std::collections::{BTreeMap, BTreeSet};

use handlebars::Handlebars;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{EvaluationError, FailureCause};

/// Parameters supplied once when a flow is invoked.
///
/// There is no way to change a `FlowInput` after construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowInput {
    values: Map<String, Value>,
    secrets: BTreeSet<String>,
}

impl FlowInput {
    /// Create an input from raw values, without schema checks.
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            values,
            secrets: BTreeSet::new(),
        }
    }

    pub(crate) fn with_secrets(values: Map<String, Value>, secrets: BTreeSet<String>) -> Self {
        Self { values, secrets }
    }

    /// Get a parameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Whether a parameter is marked sensitive.
    pub fn is_secret(&self, name: &str) -> bool {
        self.secrets.contains(name)
    }

    /// All parameters as a JSON object.
    pub fn as_json(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// All parameters with sensitive values masked, for logging.
    pub fn redacted(&self) -> Value {
        let masked = self
            .values
            .iter()
            .map(|(k, v)| {
                let v = if self.secrets.contains(k) {
                    Value::String("***".to_string())
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect();
        Value::Object(masked)
    }
}

/// What a completed step left in the results map.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Succeeded(Value),
    /// The step failed and a failure policy absorbed it.
    Tolerated(FailureCause),
}

impl StepResult {
    /// The value expressions see for this step.
    pub fn value(&self) -> Value {
        match self {
            StepResult::Succeeded(v) => v.clone(),
            StepResult::Tolerated(_) => Value::Null,
        }
    }
}

/// A step id was recorded twice in one run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("result of step `{0}` was already recorded")]
pub struct DuplicateWrite(pub String);

/// Append-once store of step results for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultsMap {
    entries: BTreeMap<String, StepResult>,
    not_executed: BTreeSet<String>,
}

impl ResultsMap {
    /// Record the result of a completed step.
    pub fn record(&mut self, id: &str, result: StepResult) -> Result<(), DuplicateWrite> {
        if self.entries.contains_key(id) {
            return Err(DuplicateWrite(id.to_string()));
        }
        self.not_executed.remove(id);
        self.entries.insert(id.to_string(), result);
        Ok(())
    }

    /// Note that a step will not run in this run.
    pub fn mark_not_executed(&mut self, id: &str) {
        if !self.entries.contains_key(id) {
            self.not_executed.insert(id.to_string());
        }
    }

    /// Get the result of a step, if it produced one.
    pub fn get(&self, id: &str) -> Option<&StepResult> {
        self.entries.get(id)
    }

    /// Whether the step produced an entry.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether the step was skipped.
    pub fn was_skipped(&self, id: &str) -> bool {
        self.not_executed.contains(id)
    }

    /// Ids with an entry, in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no step has produced an entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `results.<id>` for an expression.
    ///
    /// Tolerated failures and skipped steps read as `null`.
    pub fn resolve(&self, id: &str) -> Result<Value, EvaluationError> {
        match self.entries.get(id) {
            Some(result) => Ok(result.value()),
            None if self.not_executed.contains(id) => Ok(Value::Null),
            None => Err(EvaluationError::UnresolvedDependency(id.to_string())),
        }
    }

    /// All entries as a JSON object, as expressions see them.
    pub fn as_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.value()))
                .collect(),
        )
    }
}

/// Render a Handlebars template against the flow input and results.
///
/// Output that parses as JSON is returned as JSON, otherwise as a string.
pub(crate) fn render_template(
    template: &str,
    input: &FlowInput,
    results: &ResultsMap,
) -> Result<Value, EvaluationError> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb.register_escape_fn(handlebars::no_escape);

    let mut data = Map::new();
    data.insert("flow_input".to_string(), input.as_json());
    data.insert("results".to_string(), results.as_json());

    let rendered = hb
        .render_template(template, &data)
        .map_err(|e| EvaluationError::Template(e.to_string()))?;

    match serde_json::from_str::<Value>(&rendered) {
        Ok(v) => Ok(v),
        Err(_) => Ok(Value::String(rendered)),
    }
}
