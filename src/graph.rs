//! Validated, immutable flow graph.
//!
//! Building a graph compiles every expression and checks that each
//! `results.<id>` reference points at a step that completes strictly
//! before the referencing step. Steps nested under an earlier step may
//! legitimately be absent at run time (their branch did not run); the
//! evaluator reads those as `null`.

use std::collections::{HashMap, HashSet};

use crate::error::{DefinitionError, InputError};
use crate::expr::{CompiledExpr, Expression};
use crate::flow::FlowDefinition;
use crate::policy::FailurePolicy;
use crate::schema::InputSchema;
use crate::step::{Branch, Step, StepKind};

/// A flow ready to run. Reusable across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGraph {
    name: String,
    schema: Option<InputSchema>,
    nodes: Vec<Node>,
    /// Every step id, in definition order.
    order: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub policy: FailurePolicy,
    pub skip_if: Option<CompiledExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeKind {
    Leaf {
        body: String,
        inputs: Vec<(String, CompiledExpr)>,
    },
    Sequence(Vec<Node>),
    BranchAll {
        parallel: bool,
        branches: Vec<BranchNode>,
    },
    BranchOne {
        branches: Vec<BranchNode>,
        default: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BranchNode {
    pub label: String,
    pub predicate: Option<CompiledExpr>,
    pub policy: FailurePolicy,
    pub parallel: bool,
    pub nodes: Vec<Node>,
}

impl Node {
    /// Ids of this node and everything nested under it.
    pub fn subtree_ids(&self, out: &mut Vec<String>) {
        out.push(self.id.clone());
        match &self.kind {
            NodeKind::Leaf { .. } => {}
            NodeKind::Sequence(children) => children.iter().for_each(|c| c.subtree_ids(out)),
            NodeKind::BranchAll { branches, .. } => {
                for branch in branches {
                    branch.nodes.iter().for_each(|c| c.subtree_ids(out));
                }
            }
            NodeKind::BranchOne { branches, default } => {
                for branch in branches {
                    branch.nodes.iter().for_each(|c| c.subtree_ids(out));
                }
                default.iter().for_each(|c| c.subtree_ids(out));
            }
        }
    }
}

impl FlowGraph {
    /// Validate a definition and compile it.
    pub fn build(definition: &FlowDefinition) -> Result<Self, DefinitionError> {
        let mut index = Index::default();
        index.collect(definition.modules(), &[])?;

        let mut available = HashSet::new();
        let nodes = index.sequence(definition.modules(), &[], &mut available)?;

        Ok(Self {
            name: definition.summary.clone(),
            schema: definition.schema.clone(),
            nodes,
            order: index.order,
        })
    }

    /// Flow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema of the flow input.
    pub fn schema(&self) -> Option<&InputSchema> {
        self.schema.as_ref()
    }

    /// Every step id, in definition order.
    pub fn step_ids(&self) -> &[String] {
        &self.order
    }

    /// Whether the graph has a step with this id.
    pub fn contains(&self, id: &str) -> bool {
        self.order.iter().any(|s| s == id)
    }

    /// Body keys of all leaf steps.
    pub fn body_keys(&self) -> Vec<&str> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a str>) {
            for node in nodes {
                match &node.kind {
                    NodeKind::Leaf { body, .. } => out.push(body),
                    NodeKind::Sequence(children) => walk(children, out),
                    NodeKind::BranchAll { branches, .. } => {
                        branches.iter().for_each(|b| walk(&b.nodes, out))
                    }
                    NodeKind::BranchOne { branches, default } => {
                        branches.iter().for_each(|b| walk(&b.nodes, out));
                        walk(default, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Enclosing branchall branch of a step: (branchall id, branch index).
type Frame = (String, usize);

#[derive(Default)]
struct Index {
    frames: HashMap<String, Vec<Frame>>,
    order: Vec<String>,
}

impl Index {
    /// First pass: ids must be unique; remember where each one lives.
    fn collect(&mut self, steps: &[Step], frames: &[Frame]) -> Result<(), DefinitionError> {
        for step in steps {
            if step.id.is_empty() {
                return Err(DefinitionError::EmptyStepId);
            }
            if self.frames.contains_key(&step.id) {
                return Err(DefinitionError::DuplicateStepId(step.id.clone()));
            }
            self.frames.insert(step.id.clone(), frames.to_vec());
            self.order.push(step.id.clone());

            match &step.value {
                StepKind::Rawscript(_) => {}
                StepKind::Sequence(seq) => self.collect(&seq.modules, frames)?,
                StepKind::Branchall(node) => {
                    for (i, branch) in node.branches.iter().enumerate() {
                        let mut inner = frames.to_vec();
                        inner.push((step.id.clone(), i));
                        self.collect(&branch.modules, &inner)?;
                    }
                }
                StepKind::Branchone(node) => {
                    for branch in &node.branches {
                        self.collect(&branch.modules, frames)?;
                    }
                    if let Some(default) = &node.default {
                        self.collect(default, frames)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Second pass: compile steps in order, tracking which ids have completed.
    fn sequence(
        &self,
        steps: &[Step],
        frames: &[Frame],
        available: &mut HashSet<String>,
    ) -> Result<Vec<Node>, DefinitionError> {
        let mut nodes = Vec::with_capacity(steps.len());
        for step in steps {
            let node = self.step(step, frames, available)?;
            let mut done = Vec::new();
            node.subtree_ids(&mut done);
            available.extend(done);
            nodes.push(node);
        }
        Ok(nodes)
    }

    fn step(
        &self,
        step: &Step,
        frames: &[Frame],
        available: &HashSet<String>,
    ) -> Result<Node, DefinitionError> {
        let skip_if = match &step.skip_if {
            Some(skip) => {
                self.predicate(&step.id, "skip_if", &skip.expr, frames, available)?
            }
            None => None,
        };

        let kind = match &step.value {
            StepKind::Rawscript(leaf) => {
                let mut inputs = Vec::with_capacity(leaf.input_transforms.len());
                for (name, expr) in &leaf.input_transforms {
                    let compiled = self.compile(&step.id, name, expr)?;
                    self.check_references(&step.id, &compiled, frames, available)?;
                    check_static_type(step, name, &compiled, leaf.schema.as_ref())?;
                    inputs.push((name.clone(), compiled));
                }
                NodeKind::Leaf {
                    body: step.body_key().unwrap_or(step.id.as_str()).to_string(),
                    inputs,
                }
            }
            StepKind::Sequence(seq) => {
                let mut inner = available.clone();
                NodeKind::Sequence(self.sequence(&seq.modules, frames, &mut inner)?)
            }
            StepKind::Branchall(node) => {
                let mut branches = Vec::with_capacity(node.branches.len());
                for (i, branch) in node.branches.iter().enumerate() {
                    let mut inner_frames = frames.to_vec();
                    inner_frames.push((step.id.clone(), i));
                    branches.push(self.branch(step, i, branch, frames, &inner_frames, available)?);
                }
                NodeKind::BranchAll {
                    parallel: node.parallel,
                    branches,
                }
            }
            StepKind::Branchone(node) => {
                if node.branches.is_empty() && node.default.is_none() {
                    return Err(DefinitionError::UnreachableBranch(step.id.clone()));
                }
                let mut branches = Vec::with_capacity(node.branches.len());
                for (i, branch) in node.branches.iter().enumerate() {
                    branches.push(self.branch(step, i, branch, frames, frames, available)?);
                }
                let default = match &node.default {
                    Some(steps) => {
                        let mut inner = available.clone();
                        self.sequence(steps, frames, &mut inner)?
                    }
                    None => Vec::new(),
                };
                NodeKind::BranchOne { branches, default }
            }
        };

        Ok(Node {
            id: step.id.clone(),
            kind,
            policy: FailurePolicy::for_step(step.continue_on_error),
            skip_if,
        })
    }

    fn branch(
        &self,
        step: &Step,
        index: usize,
        branch: &Branch,
        frames: &[Frame],
        inner_frames: &[Frame],
        available: &HashSet<String>,
    ) -> Result<BranchNode, DefinitionError> {
        let location = format!("branch {index}");
        let predicate = self.predicate(&step.id, &location, &branch.expr, frames, available)?;
        let mut inner = available.clone();
        let nodes = self.sequence(&branch.modules, inner_frames, &mut inner)?;
        Ok(BranchNode {
            label: branch.summary.clone().unwrap_or(location),
            predicate,
            policy: FailurePolicy::for_branch(branch.skip_failure),
            parallel: branch.parallel,
            nodes,
        })
    }

    /// Compile a predicate; an empty source means "always".
    fn predicate(
        &self,
        step: &str,
        location: &str,
        source: &str,
        frames: &[Frame],
        available: &HashSet<String>,
    ) -> Result<Option<CompiledExpr>, DefinitionError> {
        if source.trim().is_empty() {
            return Ok(None);
        }
        let compiled = self.compile(step, location, &Expression::reference(source))?;
        self.check_references(step, &compiled, frames, available)?;
        Ok(Some(compiled))
    }

    fn compile(
        &self,
        step: &str,
        location: &str,
        expr: &Expression,
    ) -> Result<CompiledExpr, DefinitionError> {
        expr.compile()
            .map_err(|err| DefinitionError::MalformedExpression {
                step: step.to_string(),
                location: location.to_string(),
                message: err.message,
            })
    }

    fn check_references(
        &self,
        step: &str,
        expr: &CompiledExpr,
        frames: &[Frame],
        available: &HashSet<String>,
    ) -> Result<(), DefinitionError> {
        for reference in expr.references() {
            if available.contains(&reference) {
                continue;
            }
            let Some(target_frames) = self.frames.get(&reference) else {
                return Err(DefinitionError::DanglingReference {
                    step: step.to_string(),
                    reference,
                });
            };
            // Same branchall, different branch: siblings are independent.
            let sibling = frames.iter().find_map(|(node, i)| {
                target_frames
                    .iter()
                    .find(|(other, j)| other == node && j != i)
                    .map(|(other, _)| other.clone())
            });
            return Err(match sibling {
                Some(node) => DefinitionError::CrossBranchReference {
                    step: step.to_string(),
                    reference,
                    node,
                },
                None => DefinitionError::OutOfOrderReference {
                    step: step.to_string(),
                    reference,
                },
            });
        }
        Ok(())
    }
}

fn check_static_type(
    step: &Step,
    input: &str,
    expr: &CompiledExpr,
    schema: Option<&InputSchema>,
) -> Result<(), DefinitionError> {
    let (CompiledExpr::Static(value), Some(schema)) = (expr, schema) else {
        return Ok(());
    };
    let Some(property) = schema.properties.get(input) else {
        return Ok(());
    };
    if value.is_null() {
        return Ok(());
    }
    match property.check(input, value) {
        Err(InputError::TypeMismatch { expected, .. }) => Err(DefinitionError::StaticTypeMismatch {
            step: step.id.clone(),
            input: input.to_string(),
            expected,
        }),
        _ => Ok(()),
    }
}
