//! # flowgraph
//!
//! Declarative flow graphs with branch-aware concurrent execution.
//!
//! A flow is a list of steps. Leaf steps call an opaque body with inputs
//! wired from the flow input or earlier results; `branchall` runs every
//! matching branch concurrently, `branchone` runs the first matching
//! branch, and `sequence` groups steps in order. Failures abort the run
//! unless a branch (`skip_failure`) or step (`continue_on_error`) absorbs
//! them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgraph::{Branch, Dispatcher, Engine, FlowDefinition, FlowGraph, FlowInput, LeafFailure, Step};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let flow = FlowDefinition::new("daily-report")
//!     .add(Step::leaf("download").with_param("bucket", "reports"))
//!     .add(Step::leaf("parse").with_ref("csv", "results.download"))
//!     .add(
//!         Step::branch_all("publish")
//!             .branch(Branch::new().skip_failure().step(Step::leaf("email").with_ref("rows", "results.parse")))
//!             .branch(Branch::when("flow_input.save_png").step(Step::leaf("png").with_ref("rows", "results.parse"))),
//!     )
//!     .build();
//!
//! let graph = FlowGraph::build(&flow)?;
//! let dispatcher = Dispatcher::new()
//!     .register_fn("download", |_| async { Ok::<_, LeafFailure>(json!("a,b\n1,2")) });
//!
//! let report = Engine::new(dispatcher).run(&graph, FlowInput::default()).await;
//! println!("{:?}", report.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## YAML Definition
//!
//! ```yaml
//! summary: daily-report
//! value:
//!   modules:
//!     - id: download
//!       value:
//!         type: rawscript
//!         input_transforms:
//!           bucket: { type: static, value: reports }
//!     - id: publish
//!       value:
//!         type: branchone
//!         branches:
//!           - expr: flow_input.fmt != 'pdf'
//!             modules: [ ... ]
//!         default: [ ... ]
//! ```

mod config;
mod context;
mod dispatch;
mod error;
mod eval;
mod executor;
mod expr;
mod flow;
mod graph;
mod policy;
mod schema;
mod step;
pub mod yaml;

pub use config::EngineConfig;
pub use context::{DuplicateWrite, FlowInput, ResultsMap, StepResult};
pub use dispatch::{Dispatcher, FnLeaf, LeafBody};
pub use error::{
    AggregateFailure, DefinitionError, EvaluationError, FailureCause, InputError, LeafFailure,
    ParseError, StepFailure,
};
pub use eval::{evaluate, is_truthy};
pub use executor::{execute, Engine, RunReport, RunStatus, StepStatus};
pub use expr::{CompiledExpr, Expression};
pub use flow::{FlowBuilder, FlowDefinition, FlowValue};
pub use graph::FlowGraph;
pub use policy::FailurePolicy;
pub use schema::{InputSchema, ParamType, Property};
pub use step::{Branch, BranchAll, BranchOne, Leaf, Sequence, SkipIf, Step, StepBuilder, StepKind};
pub use yaml::parse_yaml;

/// Re-export common types
pub use serde_json::Value;

/// Re-export for implementing [`LeafBody`].
pub use async_trait::async_trait;
