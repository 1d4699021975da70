//! Workflow engine core: definitions, validation, planning, and execution.
//!
//! - `references` -- `{{ ... }}` template scanning and path-root extraction
//! - `dag` -- dependency graph, cycle detection, layered execution plans
//! - `definition` -- JSON/YAML parsing, serialization, filesystem load/save
//! - `validator` -- strict and draft validation with stable issue codes
//! - `expression` -- condition evaluator with JavaScript comparison semantics
//! - `context` -- per-run context and template resolution
//! - `control_flow` -- merge, filter, transform, conditional, template
//! - `step_runner` -- step dispatch, `loop`, and the `ToolExecutor` seam
//! - `executor` -- layered concurrent engine

pub mod context;
pub mod control_flow;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod references;
pub mod step_runner;
pub mod validator;

pub use definition::WorkflowError;
pub use executor::{ExecutionResult, ExecutorError, RunObserver, RunOptions, WorkflowEngine};
pub use step_runner::{NoopTools, StepError, ToolEnv, ToolExecutor, ToolRegistry};
