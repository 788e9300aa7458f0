//! Flow execution engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::context::{FlowInput, ResultsMap, StepResult};
use crate::dispatch::Dispatcher;
use crate::error::{AggregateFailure, FailureCause, InputError, StepFailure};
use crate::eval::{evaluate, evaluate_predicate, is_truthy};
use crate::expr::CompiledExpr;
use crate::graph::{BranchNode, FlowGraph, Node, NodeKind};

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Succeeded,
    /// Completed, but some failures were absorbed by policy.
    PartiallySucceeded { tolerated: Vec<StepFailure> },
    Failed(AggregateFailure),
}

/// Per-step outcome of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    Succeeded(Value),
    FailedTolerated(FailureCause),
    FailedFatal(FailureCause),
    /// The step's branch was not taken, it was skipped, or the run stopped first.
    NotExecuted,
}

/// Result of a flow run.
#[derive(Debug)]
pub struct RunReport {
    /// Flow name
    pub flow: String,

    /// Value of the last top-level step
    pub result: Value,

    /// All step results
    pub results: ResultsMap,

    pub status: RunStatus,

    /// Outcome of every step of the graph
    pub steps: BTreeMap<String, StepStatus>,

    /// Total execution time in milliseconds
    pub duration_ms: f64,
}

impl RunReport {
    /// Whether the run completed (possibly with tolerated failures).
    pub fn is_success(&self) -> bool {
        !matches!(self.status, RunStatus::Failed(_))
    }

    /// The fatal failure, if the run was aborted.
    pub fn failure(&self) -> Option<&AggregateFailure> {
        match &self.status {
            RunStatus::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Outcome of one step.
    pub fn status_of(&self, id: &str) -> Option<&StepStatus> {
        self.steps.get(id)
    }

    /// Value produced by a step that succeeded.
    pub fn value_of(&self, id: &str) -> Option<&Value> {
        match self.results.get(id) {
            Some(StepResult::Succeeded(value)) => Some(value),
            _ => None,
        }
    }
}

/// Runs flow graphs against a registry of leaf bodies.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    dispatcher: Dispatcher,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine with default configuration.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            config: EngineConfig::default(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply the graph's input schema, then run.
    pub async fn run_with(
        &self,
        graph: &FlowGraph,
        raw: Map<String, Value>,
    ) -> Result<RunReport, InputError> {
        let input = match graph.schema() {
            Some(schema) => schema.apply(raw)?,
            None => FlowInput::new(raw),
        };
        Ok(self.run(graph, input).await)
    }

    /// Run a graph to completion.
    ///
    /// Always returns a report; step failures are recorded in it rather
    /// than raised.
    pub async fn run(&self, graph: &FlowGraph, input: FlowInput) -> RunReport {
        tracing::info!(
            flow = %graph.name(),
            steps = graph.step_ids().len(),
            input = %input.redacted(),
            "Starting flow"
        );

        for key in graph.body_keys() {
            if !self.dispatcher.contains(key) {
                tracing::warn!(flow = %graph.name(), body = key, "No leaf body registered");
            }
        }

        let start = Instant::now();
        let run = Run {
            engine: self,
            input: &input,
            results: Mutex::new(ResultsMap::default()),
            tolerated: Mutex::new(Vec::new()),
        };

        let outcome = run.sequence(graph.nodes()).await;
        let results = run.results.into_inner();
        let tolerated = run.tolerated.into_inner();
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (result, status) = match outcome {
            Ok(value) if tolerated.is_empty() => (value, RunStatus::Succeeded),
            Ok(value) => (value, RunStatus::PartiallySucceeded { tolerated }),
            Err(failure) => (Value::Null, RunStatus::Failed(failure)),
        };

        match &status {
            RunStatus::Failed(failure) => tracing::error!(
                flow = %graph.name(),
                step = failure.first_step().unwrap_or_default(),
                error = %failure,
                total_ms = duration_ms,
                "Flow failed"
            ),
            _ => tracing::info!(
                flow = %graph.name(),
                total_ms = duration_ms,
                tolerated = matches!(status, RunStatus::PartiallySucceeded { .. }),
                "Flow completed"
            ),
        }

        let steps = step_statuses(graph, &results, &status);

        RunReport {
            flow: graph.name().to_string(),
            result,
            results,
            status,
            steps,
            duration_ms,
        }
    }
}

/// Run a graph with default configuration.
pub async fn execute(graph: &FlowGraph, dispatcher: Dispatcher, input: FlowInput) -> RunReport {
    Engine::new(dispatcher).run(graph, input).await
}

fn step_statuses(
    graph: &FlowGraph,
    results: &ResultsMap,
    status: &RunStatus,
) -> BTreeMap<String, StepStatus> {
    let mut fatal: BTreeMap<&str, &FailureCause> = BTreeMap::new();
    if let RunStatus::Failed(failure) = status {
        for f in &failure.failures {
            for id in &f.path {
                fatal.entry(id.as_str()).or_insert(&f.cause);
            }
        }
    }

    graph
        .step_ids()
        .iter()
        .map(|id| {
            let status = match (results.get(id), fatal.get(id.as_str())) {
                (Some(StepResult::Succeeded(v)), _) => StepStatus::Succeeded(v.clone()),
                (Some(StepResult::Tolerated(cause)), _) => StepStatus::FailedTolerated(cause.clone()),
                (None, Some(cause)) => StepStatus::FailedFatal((*cause).clone()),
                (None, None) => StepStatus::NotExecuted,
            };
            (id.clone(), status)
        })
        .collect()
}

type Outcome = Result<Value, AggregateFailure>;

/// State of one run. Dropped when the run completes.
struct Run<'a> {
    engine: &'a Engine,
    input: &'a FlowInput,
    results: Mutex<ResultsMap>,
    tolerated: Mutex<Vec<StepFailure>>,
}

impl<'a> Run<'a> {
    fn sequence<'s>(&'s self, nodes: &'s [Node]) -> BoxFuture<'s, Outcome> {
        Box::pin(async move {
            let mut last = Value::Null;
            for (i, node) in nodes.iter().enumerate() {
                match self.step(node).await {
                    Ok(value) => last = value,
                    Err(failure) => {
                        self.skip(&nodes[i + 1..]);
                        return Err(failure);
                    }
                }
            }
            Ok(last)
        })
    }

    fn step<'s>(&'s self, node: &'s Node) -> BoxFuture<'s, Outcome> {
        Box::pin(async move {
            match self.should_skip(node) {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!(step = %node.id, "Skipping step");
                    self.skip(std::slice::from_ref(node));
                    return Ok(Value::Null);
                }
                Err(failure) => return self.settle(node, Err(failure)),
            }

            let started = Instant::now();
            let outcome = match &node.kind {
                NodeKind::Leaf { body, inputs } => self.leaf(node, body, inputs).await,
                NodeKind::Sequence(children) => self.sequence(children).await,
                NodeKind::BranchAll { parallel, branches } => {
                    self.branch_all(node, *parallel, branches).await
                }
                NodeKind::BranchOne { branches, default } => {
                    self.branch_one(node, branches, default).await
                }
            };

            tracing::debug!(
                step = %node.id,
                ok = outcome.is_ok(),
                duration_ms = started.elapsed().as_secs_f64() * 1000.0,
                "Step finished"
            );

            self.settle(node, outcome)
        })
    }

    async fn leaf(&self, node: &Node, body: &str, inputs: &[(String, CompiledExpr)]) -> Outcome {
        let resolved = self.resolve_inputs(node, inputs)?;

        tracing::debug!(step = %node.id, body, inputs = resolved.len(), "Executing step");

        self.engine
            .dispatcher
            .dispatch(body, resolved)
            .await
            .map_err(|e| AggregateFailure::single(StepFailure::new(&node.id, e)))
    }

    async fn branch_all(&self, node: &Node, parallel: bool, branches: &[BranchNode]) -> Outcome {
        let selected = self.select_all(node, branches)?;

        for (i, branch) in branches.iter().enumerate() {
            if !selected.contains(&i) {
                tracing::debug!(step = %node.id, branch = %branch.label, "Branch not taken");
                self.skip(&branch.nodes);
            }
        }

        let (concurrent, serial): (Vec<usize>, Vec<usize>) = selected
            .into_iter()
            .partition(|&i| parallel && branches[i].parallel);

        let mut slots = vec![Value::Null; branches.len()];
        let mut failure: Option<AggregateFailure> = None;

        if !concurrent.is_empty() {
            tracing::debug!(
                step = %node.id,
                branches = concurrent.len(),
                "Dispatching branches concurrently"
            );

            // Siblings already dispatched run to completion even if one fails;
            // branches still queued behind the limit are not started.
            let halted = &AtomicBool::new(false);
            let mut outcomes: Vec<(usize, Outcome)> = stream::iter(concurrent.into_iter().map(|i| {
                // Runs when the stream hands the branch to the buffer.
                let dispatched = !halted.load(Ordering::SeqCst);
                async move {
                    let branch = &branches[i];
                    if !dispatched {
                        tracing::debug!(step = %node.id, branch = %branch.label, "Branch not started");
                        self.skip(&branch.nodes);
                        return (i, Ok(Value::Null));
                    }
                    let outcome = self.branch(branch).await;
                    if outcome.is_err() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    (i, outcome)
                }
            }))
            .buffer_unordered(self.engine.config.max_parallel_branches.max(1))
            .collect()
            .await;
            outcomes.sort_by_key(|(i, _)| *i);

            for (i, outcome) in outcomes {
                match outcome {
                    Ok(value) => slots[i] = value,
                    Err(f) => merge(&mut failure, f),
                }
            }
        }

        for i in serial {
            if failure.is_some() {
                self.skip(&branches[i].nodes);
                continue;
            }
            match self.branch(&branches[i]).await {
                Ok(value) => slots[i] = value,
                Err(f) => merge(&mut failure, f),
            }
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(Value::Array(slots)),
        }
    }

    async fn branch_one(&self, node: &Node, branches: &[BranchNode], default: &[Node]) -> Outcome {
        let chosen = self.select_one(node, branches)?;

        for (i, branch) in branches.iter().enumerate() {
            if chosen != Some(i) {
                self.skip(&branch.nodes);
            }
        }

        match chosen {
            Some(i) => {
                self.skip(default);
                tracing::debug!(step = %node.id, branch = %branches[i].label, "Branch chosen");
                self.branch(&branches[i]).await
            }
            None => {
                tracing::debug!(step = %node.id, "No branch matched, running default");
                self.sequence(default).await
            }
        }
    }

    /// Run one branch, absorbing failures if the branch allows it.
    async fn branch(&self, branch: &BranchNode) -> Outcome {
        match self.sequence(&branch.nodes).await {
            Ok(value) => Ok(value),
            Err(failure) if branch.policy.should_tolerate_all(&failure) => {
                tracing::warn!(branch = %branch.label, error = %failure, "Branch failure skipped");
                self.tolerate(failure);
                Ok(Value::Null)
            }
            Err(failure) => Err(failure),
        }
    }

    /// Record the outcome of a step, applying its failure policy.
    fn settle(&self, node: &Node, outcome: Outcome) -> Outcome {
        match outcome {
            Ok(value) => {
                self.record(&node.id, StepResult::Succeeded(value.clone()));
                Ok(value)
            }
            Err(failure) => {
                let failure = failure.through(&node.id);
                self.skip_untouched(node, &failure);
                if node.policy.should_tolerate_all(&failure) {
                    tracing::warn!(step = %node.id, error = %failure, "Step failure tolerated");
                    self.tolerate(failure);
                    Ok(Value::Null)
                } else {
                    Err(failure)
                }
            }
        }
    }

    /// Give every step on the failure paths a tolerated entry.
    fn tolerate(&self, failure: AggregateFailure) {
        for f in &failure.failures {
            for id in &f.path {
                // Sibling failures share the path above their fork.
                if !self.results.lock().contains(id) {
                    self.record(id, StepResult::Tolerated(f.cause.clone()));
                }
            }
        }
        self.tolerated.lock().extend(failure.failures);
    }

    fn record(&self, id: &str, result: StepResult) {
        if let Err(e) = self.results.lock().record(id, result) {
            tracing::error!(step = id, error = %e, "Result written twice");
        }
    }

    /// Mark what a failing node left unrun as not executed. Steps on the
    /// failure path are not marked.
    fn skip_untouched(&self, node: &Node, failure: &AggregateFailure) {
        let mut ids = Vec::new();
        node.subtree_ids(&mut ids);
        let mut results = self.results.lock();
        for id in &ids {
            if !failure.failures.iter().any(|f| f.path.contains(id)) {
                results.mark_not_executed(id);
            }
        }
    }

    /// Mark nodes, and everything under them, as not executed.
    fn skip(&self, nodes: &[Node]) {
        let mut ids = Vec::new();
        for node in nodes {
            node.subtree_ids(&mut ids);
        }
        let mut results = self.results.lock();
        for id in &ids {
            results.mark_not_executed(id);
        }
    }

    fn should_skip(&self, node: &Node) -> Result<bool, AggregateFailure> {
        let Some(expr) = &node.skip_if else {
            return Ok(false);
        };
        let results = self.results.lock();
        evaluate(expr, self.input, &results)
            .map(|v| is_truthy(&v))
            .map_err(|e| AggregateFailure::single(StepFailure::new(&node.id, e)))
    }

    fn resolve_inputs(
        &self,
        node: &Node,
        inputs: &[(String, CompiledExpr)],
    ) -> Result<Map<String, Value>, AggregateFailure> {
        let results = self.results.lock();
        let mut resolved = Map::new();
        for (name, expr) in inputs {
            let value = evaluate(expr, self.input, &results)
                .map_err(|e| AggregateFailure::single(StepFailure::new(&node.id, e)))?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    fn select_all(&self, node: &Node, branches: &[BranchNode]) -> Result<Vec<usize>, AggregateFailure> {
        let results = self.results.lock();
        let mut selected = Vec::new();
        for (i, branch) in branches.iter().enumerate() {
            let taken = evaluate_predicate(branch.predicate.as_ref(), self.input, &results)
                .map_err(|e| AggregateFailure::single(StepFailure::new(&node.id, e)))?;
            if taken {
                selected.push(i);
            }
        }
        Ok(selected)
    }

    fn select_one(&self, node: &Node, branches: &[BranchNode]) -> Result<Option<usize>, AggregateFailure> {
        let results = self.results.lock();
        for (i, branch) in branches.iter().enumerate() {
            let taken = evaluate_predicate(branch.predicate.as_ref(), self.input, &results)
                .map_err(|e| AggregateFailure::single(StepFailure::new(&node.id, e)))?;
            if taken {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }
}

fn merge(slot: &mut Option<AggregateFailure>, failure: AggregateFailure) {
    match slot {
        Some(existing) => existing.merge(failure),
        None => *slot = Some(failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LeafFailure;
    use crate::flow::FlowDefinition;
    use crate::step::{Branch, Step};
    use serde_json::json;

    fn echo_n(dispatcher: Dispatcher, key: &str) -> Dispatcher {
        dispatcher.register_fn(key, |input| async move {
            Ok::<_, LeafFailure>(input.get("n").cloned().unwrap_or(Value::Null))
        })
    }

    fn fail(dispatcher: Dispatcher, key: &str) -> Dispatcher {
        dispatcher.register_fn(key, |_| async move { Err::<Value, _>(LeafFailure::new("boom")) })
    }

    fn input(value: Value) -> FlowInput {
        FlowInput::new(value.as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_skip_if_marks_step_not_executed() {
        let flow = FlowDefinition::new("skip")
            .step(Step::leaf("a").with_param("n", 1).skip_if("flow_input.dry_run"))
            .step(Step::leaf("b").with_ref("n", "results.a ?? 'none'"))
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = echo_n(echo_n(Dispatcher::new(), "a"), "b");

        let report = Engine::new(dispatcher)
            .run(&graph, input(json!({"dry_run": true})))
            .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.status_of("a"), Some(&StepStatus::NotExecuted));
        assert_eq!(report.value_of("b"), Some(&json!("none")));
    }

    #[tokio::test]
    async fn test_continue_on_error_yields_null() {
        let flow = FlowDefinition::new("coe")
            .step(Step::leaf("a").continue_on_error())
            .step(Step::leaf("b").with_ref("n", "results.a || 'fallback'"))
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = echo_n(fail(Dispatcher::new(), "a"), "b");

        let report = Engine::new(dispatcher).run(&graph, FlowInput::default()).await;

        assert!(matches!(report.status, RunStatus::PartiallySucceeded { ref tolerated } if tolerated.len() == 1));
        assert!(matches!(report.status_of("a"), Some(StepStatus::FailedTolerated(_))));
        assert_eq!(report.value_of("b"), Some(&json!("fallback")));
        assert_eq!(report.result, json!("fallback"));
    }

    #[tokio::test]
    async fn test_sequence_stops_on_fatal_failure() {
        let flow = FlowDefinition::new("fatal")
            .step(
                Step::sequence("group")
                    .child(Step::leaf("a"))
                    .child(Step::leaf("b")),
            )
            .step(Step::leaf("c"))
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = echo_n(echo_n(fail(Dispatcher::new(), "a"), "b"), "c");

        let report = Engine::new(dispatcher).run(&graph, FlowInput::default()).await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.first_step(), Some("a"));
        assert_eq!(failure.failures[0].path, vec!["a", "group"]);
        assert!(matches!(report.status_of("a"), Some(StepStatus::FailedFatal(_))));
        assert!(matches!(report.status_of("group"), Some(StepStatus::FailedFatal(_))));
        assert_eq!(report.status_of("b"), Some(&StepStatus::NotExecuted));
        assert_eq!(report.status_of("c"), Some(&StepStatus::NotExecuted));
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_branch_all_result_slots() {
        let flow = FlowDefinition::new("slots")
            .step(
                Step::branch_all("fan")
                    .branch(Branch::new().step(Step::leaf("x").with_param("n", 1)))
                    .branch(Branch::when("false").step(Step::leaf("y").with_param("n", 2)))
                    .branch(Branch::new().step(Step::leaf("z").with_param("n", 3))),
            )
            .step(Step::leaf("merge").with_ref("n", "results.fan.filter(Boolean)"))
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = ["x", "y", "z", "merge"]
            .into_iter()
            .fold(Dispatcher::new(), echo_n);

        let report = Engine::new(dispatcher).run(&graph, FlowInput::default()).await;

        assert_eq!(report.value_of("fan"), Some(&json!([1, null, 3])));
        assert_eq!(report.value_of("merge"), Some(&json!([1, 3])));
    }

    #[tokio::test]
    async fn test_serial_branches_stop_after_fatal_failure() {
        let flow = FlowDefinition::new("serial")
            .step(
                Step::branch_all("fan")
                    .serial()
                    .branch(Branch::new().step(Step::leaf("first")))
                    .branch(Branch::new().step(Step::leaf("second"))),
            )
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = echo_n(fail(Dispatcher::new(), "first"), "second");

        let report = Engine::new(dispatcher).run(&graph, FlowInput::default()).await;

        assert!(!report.is_success());
        assert_eq!(report.status_of("second"), Some(&StepStatus::NotExecuted));
    }

    #[tokio::test]
    async fn test_predicate_error_fails_branch_node() {
        let flow = FlowDefinition::new("pred")
            .step(
                Step::branch_one("pick")
                    .branch(Branch::when("flow_input.missing").step(Step::leaf("a"))),
            )
            .build();
        let graph = FlowGraph::build(&flow).unwrap();

        let report = Engine::new(Dispatcher::new()).run(&graph, FlowInput::default()).await;

        let failure = report.failure().unwrap();
        assert_eq!(failure.first_step(), Some("pick"));
        assert_eq!(report.status_of("a"), Some(&StepStatus::NotExecuted));
        assert!(report.results.was_skipped("a"));
        assert!(!report.results.was_skipped("pick"));
    }

    #[tokio::test]
    async fn test_fatal_step_not_marked_skipped() {
        let flow = FlowDefinition::new("fatal")
            .step(
                Step::sequence("group")
                    .child(Step::leaf("a"))
                    .child(Step::leaf("b")),
            )
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = echo_n(fail(Dispatcher::new(), "a"), "b");

        let report = Engine::new(dispatcher).run(&graph, FlowInput::default()).await;

        assert!(matches!(report.status_of("a"), Some(StepStatus::FailedFatal(_))));
        assert!(!report.results.was_skipped("a"));
        assert!(!report.results.was_skipped("group"));
        assert!(report.results.was_skipped("b"));
    }

    #[tokio::test]
    async fn test_tolerated_failures_share_path() {
        let flow = FlowDefinition::new("shared")
            .step(
                Step::branch_all("fetch")
                    .continue_on_error()
                    .branch(Branch::new().step(Step::leaf("left")))
                    .branch(Branch::new().step(Step::leaf("right"))),
            )
            .step(Step::leaf("after").with_param("n", 1))
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = echo_n(fail(fail(Dispatcher::new(), "left"), "right"), "after");

        let report = Engine::new(dispatcher).run(&graph, FlowInput::default()).await;

        assert!(matches!(report.status, RunStatus::PartiallySucceeded { ref tolerated } if tolerated.len() == 2));
        for id in ["left", "right", "fetch"] {
            assert!(matches!(report.status_of(id), Some(StepStatus::FailedTolerated(_))), "{id}");
            assert!(!report.results.was_skipped(id), "{id}");
        }
        assert_eq!(report.value_of("after"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_queued_branch_not_started_after_fatal_failure() {
        let flow = FlowDefinition::new("queued")
            .step(
                Step::branch_all("fan")
                    .branch(Branch::new().step(Step::leaf("boom")))
                    .branch(
                        Branch::new().step(
                            Step::branch_one("later_pick")
                                .branch(Branch::new().step(Step::leaf("late_leaf"))),
                        ),
                    ),
            )
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let dispatcher = echo_n(fail(Dispatcher::new(), "boom"), "late_leaf");

        let report = Engine::new(dispatcher)
            .with_config(EngineConfig::default().with_max_parallel_branches(1))
            .run(&graph, FlowInput::default())
            .await;

        assert!(!report.is_success());
        assert_eq!(report.status_of("later_pick"), Some(&StepStatus::NotExecuted));
        assert_eq!(report.status_of("late_leaf"), Some(&StepStatus::NotExecuted));
        assert!(report.results.was_skipped("late_leaf"));
    }

    #[tokio::test]
    async fn test_run_with_applies_schema() {
        use crate::schema::{InputSchema, ParamType, Property};

        let flow = FlowDefinition::new("schema")
            .schema(
                InputSchema::default()
                    .property("n", Property::of(ParamType::Integer).with_default(7)),
            )
            .step(Step::leaf("a").with_ref("n", "flow_input.n"))
            .build();
        let graph = FlowGraph::build(&flow).unwrap();
        let engine = Engine::new(echo_n(Dispatcher::new(), "a"));

        let report = engine.run_with(&graph, Map::new()).await.unwrap();
        assert_eq!(report.value_of("a"), Some(&json!(7)));

        let mut raw = Map::new();
        raw.insert("n".to_string(), json!("seven"));
        assert!(engine.run_with(&graph, raw).await.is_err());
    }
}
