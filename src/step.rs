//! Flow step definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::expr::Expression;
use crate::schema::InputSchema;

/// A single node of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the flow; results are stored under it
    pub id: String,

    /// Description for logging/debugging
    #[serde(default)]
    pub summary: Option<String>,

    /// What the step does
    pub value: StepKind,

    /// Absorb a failure of this step and continue with a null result
    #[serde(default)]
    pub continue_on_error: bool,

    /// Skip the step when the predicate holds
    #[serde(default)]
    pub skip_if: Option<SkipIf>,
}

/// Kind-specific payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    #[serde(alias = "script", alias = "leaf")]
    Rawscript(Leaf),
    Branchall(BranchAll),
    Branchone(BranchOne),
    Sequence(Sequence),
}

/// Leaf computation dispatched to an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    /// Formal input name -> expression
    #[serde(default)]
    pub input_transforms: BTreeMap<String, Expression>,

    /// Body key; the step id is used when absent
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub language: Option<String>,

    /// Inline source, kept for reference only
    #[serde(default)]
    pub content: Option<String>,

    /// Declared inputs of the body
    #[serde(default)]
    pub schema: Option<InputSchema>,
}

/// Run every branch whose predicate holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchAll {
    pub branches: Vec<Branch>,

    #[serde(default = "default_true")]
    pub parallel: bool,
}

/// Run the first branch whose predicate holds, or the default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOne {
    pub branches: Vec<Branch>,

    #[serde(default)]
    pub default: Option<Vec<Step>>,
}

/// Children run one after another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub modules: Vec<Step>,
}

/// One guarded path of a branch step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub summary: Option<String>,

    /// Predicate; empty means always
    #[serde(default)]
    pub expr: String,

    #[serde(default)]
    pub modules: Vec<Step>,

    /// Absorb failures inside this branch
    #[serde(default)]
    pub skip_failure: bool,

    /// Run concurrently with sibling branches
    #[serde(default = "default_true")]
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipIf {
    pub expr: String,
}

fn default_true() -> bool {
    true
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            summary: None,
            expr: String::new(),
            modules: Vec::new(),
            skip_failure: false,
            parallel: true,
        }
    }
}

impl Step {
    /// Create a leaf step; its body is looked up by `id`.
    pub fn leaf(id: &str) -> StepBuilder {
        StepBuilder::new(id, StepKind::Rawscript(Leaf::default()))
    }

    /// Create a leaf step dispatched to the body registered as `path`.
    pub fn script(id: &str, path: &str) -> StepBuilder {
        StepBuilder::new(
            id,
            StepKind::Rawscript(Leaf {
                path: Some(path.to_string()),
                ..Leaf::default()
            }),
        )
    }

    /// Create a step that runs all matching branches.
    pub fn branch_all(id: &str) -> StepBuilder {
        StepBuilder::new(
            id,
            StepKind::Branchall(BranchAll {
                branches: Vec::new(),
                parallel: true,
            }),
        )
    }

    /// Create a step that runs the first matching branch.
    pub fn branch_one(id: &str) -> StepBuilder {
        StepBuilder::new(
            id,
            StepKind::Branchone(BranchOne {
                branches: Vec::new(),
                default: None,
            }),
        )
    }

    /// Create a step grouping children in order.
    pub fn sequence(id: &str) -> StepBuilder {
        StepBuilder::new(id, StepKind::Sequence(Sequence::default()))
    }

    /// Key of the body a leaf dispatches to.
    pub fn body_key(&self) -> Option<&str> {
        match &self.value {
            StepKind::Rawscript(leaf) => Some(leaf.path.as_deref().unwrap_or(&self.id)),
            _ => None,
        }
    }
}

/// Builder for creating flow steps.
#[derive(Debug, Clone)]
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    fn new(id: &str, value: StepKind) -> Self {
        Self {
            step: Step {
                id: id.to_string(),
                summary: None,
                value,
                continue_on_error: false,
                skip_if: None,
            },
        }
    }

    /// Add an input transform (leaf steps).
    pub fn input(mut self, name: &str, expr: Expression) -> Self {
        if let StepKind::Rawscript(leaf) = &mut self.step.value {
            leaf.input_transforms.insert(name.to_string(), expr);
        }
        self
    }

    /// Add a static input (leaf steps).
    pub fn with_param<V: Into<serde_json::Value>>(self, name: &str, value: V) -> Self {
        self.input(name, Expression::literal(value))
    }

    /// Add a reference input such as `results.a.rows` (leaf steps).
    pub fn with_ref(self, name: &str, expr: &str) -> Self {
        self.input(name, Expression::reference(expr))
    }

    /// Declare the body's input schema (leaf steps).
    pub fn schema(mut self, schema: InputSchema) -> Self {
        if let StepKind::Rawscript(leaf) = &mut self.step.value {
            leaf.schema = Some(schema);
        }
        self
    }

    /// Add a branch (branch steps).
    pub fn branch(mut self, branch: Branch) -> Self {
        match &mut self.step.value {
            StepKind::Branchall(node) => node.branches.push(branch),
            StepKind::Branchone(node) => node.branches.push(branch),
            _ => {}
        }
        self
    }

    /// Run matching branches one at a time (branchall steps).
    pub fn serial(mut self) -> Self {
        if let StepKind::Branchall(node) = &mut self.step.value {
            node.parallel = false;
        }
        self
    }

    /// Set the default path (branchone steps).
    pub fn default_steps<S: Into<Step>>(mut self, steps: impl IntoIterator<Item = S>) -> Self {
        if let StepKind::Branchone(node) = &mut self.step.value {
            node.default = Some(steps.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Add a child (sequence steps).
    pub fn child<S: Into<Step>>(mut self, step: S) -> Self {
        if let StepKind::Sequence(seq) = &mut self.step.value {
            seq.modules.push(step.into());
        }
        self
    }

    /// Absorb failures of this step.
    pub fn continue_on_error(mut self) -> Self {
        self.step.continue_on_error = true;
        self
    }

    /// Skip the step when `expr` holds.
    pub fn skip_if(mut self, expr: &str) -> Self {
        self.step.skip_if = Some(SkipIf {
            expr: expr.to_string(),
        });
        self
    }

    /// Set a summary.
    pub fn summary(mut self, summary: &str) -> Self {
        self.step.summary = Some(summary.to_string());
        self
    }

    /// Build the step.
    pub fn build(self) -> Step {
        self.step
    }
}

impl From<StepBuilder> for Step {
    fn from(builder: StepBuilder) -> Self {
        builder.build()
    }
}

impl Branch {
    /// An unconditional branch.
    pub fn new() -> Self {
        Self::default()
    }

    /// A branch guarded by `expr`.
    pub fn when(expr: &str) -> Self {
        Self {
            expr: expr.to_string(),
            ..Self::default()
        }
    }

    /// Add a step.
    pub fn step<S: Into<Step>>(mut self, step: S) -> Self {
        self.modules.push(step.into());
        self
    }

    /// Absorb failures inside the branch.
    pub fn skip_failure(mut self) -> Self {
        self.skip_failure = true;
        self
    }

    /// Run after the concurrent siblings instead of alongside them.
    pub fn serial(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Set a summary.
    pub fn summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_step_builder() {
        let step = Step::leaf("download")
            .with_param("bucket", "reports")
            .with_ref("key", "results.config.key")
            .build();

        assert_eq!(step.id, "download");
        assert_eq!(step.body_key(), Some("download"));
        match &step.value {
            StepKind::Rawscript(leaf) => {
                assert_eq!(
                    leaf.input_transforms.get("bucket"),
                    Some(&Expression::literal(Value::from("reports")))
                );
                assert_eq!(
                    leaf.input_transforms.get("key"),
                    Some(&Expression::reference("results.config.key"))
                );
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_script_body_key() {
        let step = Step::script("fetch", "f/finnew/fetch_index").build();
        assert_eq!(step.body_key(), Some("f/finnew/fetch_index"));
        assert_eq!(Step::sequence("group").build().body_key(), None);
    }

    #[test]
    fn test_branch_builder() {
        let step = Step::branch_one("format")
            .branch(Branch::when("flow_input.fmt == 'pdf'").step(Step::leaf("pdf")))
            .default_steps([Step::leaf("png")])
            .build();

        match step.value {
            StepKind::Branchone(node) => {
                assert_eq!(node.branches.len(), 1);
                assert_eq!(node.default.map(|d| d.len()), Some(1));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_parse_module() {
        let yaml = r#"
id: fetch
summary: Fetch all sources
value:
  type: branchall
  parallel: true
  branches:
    - summary: index
      skip_failure: true
      modules:
        - id: index_summary
          value:
            type: rawscript
            language: python3
            content: '!inline index_summary.py'
            input_transforms:
              base_url:
                type: static
                value: http://localhost:8000
    - expr: flow_input.include_foreign
      modules: []
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        match step.value {
            StepKind::Branchall(node) => {
                assert!(node.parallel);
                assert!(node.branches[0].skip_failure);
                assert!(node.branches[0].expr.is_empty());
                assert_eq!(node.branches[1].expr, "flow_input.include_foreign");
                assert!(node.branches[1].parallel);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
