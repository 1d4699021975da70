//! Workflow executor: layered concurrent DAG execution.
//!
//! `WorkflowEngine` runs a validated definition layer by layer. Steps within a
//! layer run concurrently via `futures_util::future::join_all`; their results
//! are written into the `RunContext` in layer order only after the whole layer
//! has drained, so a step never observes a sibling's output.
//!
//! # Execution flow
//!
//! 1. Validate the definition strictly.
//! 2. Resolve run inputs against the declared schema and merge defaults.
//! 3. Build the execution plan (dry runs stop here).
//! 4. For each layer: skip, gate on `condition` (per element under
//!    `forEach`), fan out over `forEach`, or dispatch.
//! 5. Record outputs, extend the skip-set with untaken conditional branches.
//! 6. Project the `output` template against the final context.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use tracing::Instrument;
use uuid::Uuid;
use weft_types::config::EngineConfig;
use weft_types::workflow::{
    ExecutionPlan, InputSchema, InputType, RunStatus, StepDefinition, StepKind, WorkflowDefinition,
};

use super::context::{RunContext, resolve_templates};
use super::dag::build_execution_plan;
use super::definition::WorkflowError;
use super::expression::{Scope, evaluate_in, resolve_path};
use super::references::single_template_body;
use super::step_runner::{StepError, StepRunner, ToolExecutor};
use super::validator::validate_strict;

/// Skip reason for members of an untaken conditional branch.
pub const REASON_BRANCH_NOT_TAKEN: &str = "branch not taken";

/// Skip reason for steps whose own `condition` evaluated false.
pub const REASON_CONDITION_NOT_MET: &str = "condition not met";

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Run-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Strict validation rejected the definition.
    #[error("workflow is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// A required input was neither provided nor defaulted.
    #[error("missing required input \"{0}\"")]
    MissingInput(String),

    /// A step failed without `continueOnError`.
    #[error("step '{step_id}' failed: {error}")]
    StepFailed {
        step_id: String,
        #[source]
        error: StepError,
    },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

// ---------------------------------------------------------------------------
// RunObserver
// ---------------------------------------------------------------------------

/// Callbacks fired over the course of a run. Every method defaults to a no-op.
pub trait RunObserver: Send + Sync {
    fn run_started(&self, _run_id: Uuid, _workflow: &str, _plan: &ExecutionPlan) {}

    fn step_started(&self, _run_id: Uuid, _step: &StepDefinition) {}

    fn step_completed(&self, _run_id: Uuid, _step_id: &str, _output: &Value, _duration: Duration) {}

    fn step_skipped(&self, _run_id: Uuid, _step_id: &str, _reason: &str) {}

    /// `continued` is true when `continueOnError` keeps the run going.
    fn step_failed(&self, _run_id: Uuid, _step_id: &str, _error: &StepError, _continued: bool) {}

    fn run_completed(&self, _run_id: Uuid, _workflow: &str, _duration: Duration, _steps_completed: usize) {}

    fn run_failed(&self, _run_id: Uuid, _workflow: &str, _error: &ExecutorError) {}
}

struct NoopObserver;

impl RunObserver for NoopObserver {}

// ---------------------------------------------------------------------------
// RunOptions / ExecutionResult
// ---------------------------------------------------------------------------

/// Per-run options.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Caller-provided run inputs, coerced against the declared schema.
    pub inputs: Map<String, Value>,
    /// Overrides merged over the definition's `defaults`.
    pub defaults: Map<String, Value>,
    /// Plan only; execute nothing.
    pub dry_run: bool,
    pub observer: Option<Arc<dyn RunObserver>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-object values are ignored.
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        if let Value::Object(map) = inputs {
            self.inputs = map;
        }
        self
    }

    /// Non-object values are ignored.
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        if let Value::Object(map) = defaults {
            self.defaults = map;
        }
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("inputs", &self.inputs)
            .field("defaults", &self.defaults)
            .field("dry_run", &self.dry_run)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Result of a finished (or dry) run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub plan: ExecutionPlan,
    /// Projected `output` template, or the full context when none is declared.
    /// `Null` for dry runs.
    pub output: Value,
    pub context: RunContext,
    /// Skipped step IDs in the order they were skipped.
    pub skipped: Vec<String>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

enum StepOutcome {
    Completed(Value),
    Skipped(&'static str),
    Failed(StepError),
}

/// Layered DAG executor, generic over the tool executor.
pub struct WorkflowEngine<E> {
    executor: E,
    config: EngineConfig,
}

impl<E: ToolExecutor> WorkflowEngine<E> {
    pub fn new(executor: E, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate, plan, and (unless dry) execute a workflow.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        options: RunOptions,
    ) -> Result<ExecutionResult, ExecutorError> {
        let run_id = Uuid::now_v7();
        let observer: &dyn RunObserver = match options.observer.as_deref() {
            Some(observer) => observer,
            None => &NoopObserver,
        };
        let span = tracing::info_span!("workflow_run", run_id = %run_id, workflow = definition.name.as_str());

        let result = self
            .run_inner(run_id, definition, &options, observer)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            tracing::warn!(run_id = %run_id, error = %e, "workflow run failed");
            observer.run_failed(run_id, &definition.name, e);
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        options: &RunOptions,
        observer: &dyn RunObserver,
    ) -> Result<ExecutionResult, ExecutorError> {
        let started = Instant::now();

        let raw = serde_json::to_value(definition)
            .map_err(|e| WorkflowError::ParseError(e.to_string()))?;
        let errors = validate_strict(&raw);
        if !errors.is_empty() {
            return Err(ExecutorError::Invalid(errors));
        }

        let inputs = resolve_run_inputs(&definition.inputs, &options.inputs)?;
        let mut defaults = definition.defaults.clone();
        for (key, value) in &options.defaults {
            defaults.insert(key.clone(), value.clone());
        }

        let plan = build_execution_plan(&definition.steps)?;
        let mut ctx = RunContext::new(inputs, defaults)
            .with_max_output_bytes(self.config.max_step_output_bytes);

        if options.dry_run {
            tracing::info!(layers = plan.len(), "dry run, skipping execution");
            return Ok(ExecutionResult {
                run_id,
                status: RunStatus::DryRun,
                plan,
                output: Value::Null,
                context: ctx,
                skipped: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        tracing::info!(
            steps = definition.steps.len(),
            layers = plan.len(),
            "starting workflow execution"
        );
        observer.run_started(run_id, &definition.name, &plan);

        let steps: HashMap<&str, &StepDefinition> = definition
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s))
            .collect();
        let mut skip_set: HashSet<String> = HashSet::new();
        let mut skipped = Vec::new();
        let mut completed = 0usize;

        for (layer_index, layer) in plan.layers.iter().enumerate() {
            tracing::debug!(layer = layer_index, steps = layer.len(), "executing layer");

            let outcomes = {
                let scope = ctx.scope();
                let pending = layer
                    .iter()
                    .filter_map(|id| steps.get(id.as_str()).copied())
                    .map(|step| {
                        let scope = &scope;
                        let skip_set = &skip_set;
                        async move {
                            let outcome = self.run_step(run_id, step, scope, skip_set, observer).await;
                            (step, outcome)
                        }
                    });
                join_all(pending).await
            };

            for (step, outcome) in outcomes {
                match outcome {
                    StepOutcome::Completed(output) => {
                        if step.tool == StepKind::Conditional {
                            skip_set.extend(untaken_branch(&output));
                        }
                        ctx.record_output(&step.id, output);
                        completed += 1;
                    }
                    StepOutcome::Skipped(reason) => {
                        ctx.record_skipped(&step.id, reason);
                        skipped.push(step.id.clone());
                    }
                    StepOutcome::Failed(error) if step.continue_on_error => {
                        ctx.record_error(&step.id, &error.to_string());
                    }
                    StepOutcome::Failed(error) => {
                        return Err(ExecutorError::StepFailed {
                            step_id: step.id.clone(),
                            error,
                        });
                    }
                }
            }
        }

        let output = match &definition.output {
            Some(template) => resolve_templates(template, &ctx.scope()),
            None => ctx.to_value(),
        };
        let duration = started.elapsed();

        tracing::info!(
            duration_ms = duration.as_millis() as u64,
            completed,
            skipped = skipped.len(),
            "workflow execution completed"
        );
        observer.run_completed(run_id, &definition.name, duration, completed);

        Ok(ExecutionResult {
            run_id,
            status: RunStatus::Completed,
            plan,
            output,
            context: ctx,
            skipped,
            duration_ms: duration.as_millis() as u64,
        })
    }

    async fn run_step(
        &self,
        run_id: Uuid,
        step: &StepDefinition,
        scope: &Scope<'_>,
        skip_set: &HashSet<String>,
        observer: &dyn RunObserver,
    ) -> StepOutcome {
        let step_id = step.id.as_str();

        if skip_set.contains(step_id) {
            tracing::debug!(step_id, "skipping step, branch not taken");
            observer.step_skipped(run_id, step_id, REASON_BRANCH_NOT_TAKEN);
            return StepOutcome::Skipped(REASON_BRANCH_NOT_TAKEN);
        }
        let selection = match &step.for_each {
            Some(source) => match select_iterations(source, step.condition.as_deref(), scope) {
                Ok(items) if items.is_empty() && step.condition.is_some() => {
                    tracing::debug!(step_id, "skipping step, no forEach element met the condition");
                    observer.step_skipped(run_id, step_id, REASON_CONDITION_NOT_MET);
                    return StepOutcome::Skipped(REASON_CONDITION_NOT_MET);
                }
                other => other.map(Some),
            },
            None => {
                if let Some(condition) = &step.condition
                    && !evaluate_in(condition, scope)
                {
                    tracing::debug!(step_id, condition = condition.as_str(), "skipping step, condition not met");
                    observer.step_skipped(run_id, step_id, REASON_CONDITION_NOT_MET);
                    return StepOutcome::Skipped(REASON_CONDITION_NOT_MET);
                }
                Ok(None)
            }
        };

        tracing::debug!(step_id, name = step.display_name(), tool = %step.tool, "step started");
        observer.step_started(run_id, step);
        let started = Instant::now();
        let runner = StepRunner::new(&self.executor, self.config.max_loop_iterations);

        let result = match selection {
            Ok(Some(items)) => run_for_each(&runner, step, items, scope).await,
            Ok(None) => runner.dispatch(step.tool, &step.inputs, scope).await,
            Err(error) => Err(error),
        };
        let duration = started.elapsed();

        match result {
            Ok(output) => {
                tracing::debug!(step_id, tool = %step.tool, duration_ms = duration.as_millis() as u64, "step completed");
                observer.step_completed(run_id, step_id, &output, duration);
                StepOutcome::Completed(output)
            }
            Err(error) => {
                tracing::debug!(step_id, tool = %step.tool, error = %error, "step failed");
                observer.step_failed(run_id, step_id, &error, step.continue_on_error);
                StepOutcome::Failed(error)
            }
        }
    }
}

// -- forEach: pick elements, then run the step once per element --

/// Resolve a forEach source and keep the elements whose condition holds.
///
/// The condition sees `item` and `index` bound for each element. Elements
/// keep their position in the source array.
fn select_iterations(
    source: &str,
    condition: Option<&str>,
    scope: &Scope<'_>,
) -> Result<Vec<(usize, Value)>, StepError> {
    let path = single_template_body(source).unwrap_or(source).trim();
    let Some(Value::Array(items)) = resolve_path(path, scope) else {
        return Err(StepError::ForEachSource(source.to_string()));
    };

    Ok(items
        .into_iter()
        .enumerate()
        .filter(|(index, item)| match condition {
            Some(condition) => {
                let iteration_scope = iteration_scope(scope, *index, item.clone());
                evaluate_in(condition, &iteration_scope)
            }
            None => true,
        })
        .collect())
}

fn iteration_scope<'a>(scope: &Scope<'a>, index: usize, item: Value) -> Scope<'a> {
    scope.clone().bind("item", item).bind("index", json!(index))
}

/// Fails on the first element error.
async fn run_for_each<E: ToolExecutor>(
    runner: &StepRunner<'_, E>,
    step: &StepDefinition,
    items: Vec<(usize, Value)>,
    scope: &Scope<'_>,
) -> Result<Value, StepError> {
    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items {
        let iteration_scope = iteration_scope(scope, index, item);
        let output = runner
            .dispatch(step.tool, &step.inputs, &iteration_scope)
            .await
            .map_err(|e| StepError::ForEachItem {
                index,
                source: Box::new(e),
            })?;
        results.push(output);
    }

    Ok(json!({ "count": results.len(), "results": results }))
}

fn untaken_branch(output: &Value) -> impl Iterator<Item = String> + '_ {
    output
        .get("skippedSteps")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Input resolution
// ---------------------------------------------------------------------------

/// Coerce provided inputs to their declared types and fill schema defaults.
///
/// Undeclared inputs pass through unchanged. A value that cannot be coerced
/// is kept as provided.
pub fn resolve_run_inputs(
    schema: &BTreeMap<String, InputSchema>,
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, ExecutorError> {
    let mut resolved = provided.clone();
    for (name, input) in schema {
        match provided.get(name).filter(|v| !v.is_null()) {
            Some(value) => {
                resolved.insert(name.clone(), coerce_input(value, input.input_type));
            }
            None => match &input.default {
                Some(default) => {
                    resolved.insert(name.clone(), default.clone());
                }
                None if input.required => return Err(ExecutorError::MissingInput(name.clone())),
                None => {}
            },
        }
    }
    Ok(resolved)
}

fn coerce_input(value: &Value, input_type: InputType) -> Value {
    match (input_type, value) {
        (InputType::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                json!(n)
            } else {
                s.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map_or_else(|| value.clone(), Value::Number)
            }
        }
        (InputType::Boolean, Value::String(s)) => match s.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        (InputType::Array, Value::String(s)) => {
            if let Ok(array @ Value::Array(_)) = serde_json::from_str::<Value>(s) {
                return array;
            }
            Value::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )
        }
        (InputType::String, Value::Number(n)) => Value::String(n.to_string()),
        (InputType::String, Value::Bool(b)) => Value::String(b.to_string()),
        _ => value.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::definition_from_value;
    use crate::workflow::step_runner::{NoopTools, ToolRegistry};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workflow(value: Value) -> WorkflowDefinition {
        definition_from_value(value).unwrap()
    }

    fn search_tools() -> ToolRegistry {
        ToolRegistry::new()
            .register(StepKind::Search, |inputs, env| {
                let query = inputs["query"].as_str().unwrap_or_default().to_string();
                let collection = inputs
                    .get("collection")
                    .cloned()
                    .or_else(|| env.default_value("collection").cloned())
                    .unwrap_or(Value::Null);
                Ok(json!({
                    "collection": collection,
                    "results": [{ "id": format!("{query}-1") }, { "id": "shared" }]
                }))
            })
            .register(StepKind::Embed, |inputs, _| {
                let text = inputs["text"].as_str().unwrap_or_default();
                if text.is_empty() {
                    return Err(StepError::tool(StepKind::Embed, "nothing to embed"));
                }
                Ok(json!({ "dims": text.len() }))
            })
    }

    fn engine<E: ToolExecutor>(executor: E) -> WorkflowEngine<E> {
        WorkflowEngine::new(executor, EngineConfig::default())
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl RunObserver for Recorder {
        fn run_started(&self, _: Uuid, workflow: &str, _: &ExecutionPlan) {
            self.push(format!("run_started:{workflow}"));
        }
        fn step_started(&self, _: Uuid, step: &StepDefinition) {
            self.push(format!("started:{}", step.id));
        }
        fn step_completed(&self, _: Uuid, step_id: &str, _: &Value, _: Duration) {
            self.push(format!("completed:{step_id}"));
        }
        fn step_skipped(&self, _: Uuid, step_id: &str, reason: &str) {
            self.push(format!("skipped:{step_id}:{reason}"));
        }
        fn step_failed(&self, _: Uuid, step_id: &str, _: &StepError, continued: bool) {
            self.push(format!("failed:{step_id}:{continued}"));
        }
        fn run_failed(&self, _: Uuid, _: &str, _: &ExecutorError) {
            self.push("run_failed".to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Planning and ordering
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_diamond_runs_in_two_layers_and_merges() {
        let def = workflow(json!({
            "name": "diamond",
            "inputs": { "q": { "type": "string", "required": true } },
            "steps": [
                { "id": "a", "tool": "search", "inputs": { "query": "{{ inputs.q }}" } },
                { "id": "b", "tool": "search", "inputs": { "query": "other" } },
                {
                    "id": "c",
                    "tool": "merge",
                    "inputs": { "arrays": ["{{ a.output.results }}", "{{ b.output.results }}"], "dedup": true, "dedupField": "id" }
                }
            ],
            "output": { "merged": "{{ c.output.results }}", "count": "{{ c.output.resultCount }}" }
        }));
        let result = engine(search_tools())
            .run(&def, RunOptions::new().with_inputs(json!({ "q": "rust" })))
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.plan.layers, vec![vec!["a", "b"], vec!["c"]]);
        assert_eq!(result.output["count"], 3);
        assert_eq!(result.output["merged"][0]["id"], "rust-1");
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_executing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tools = ToolRegistry::new().register(StepKind::Models, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!([]))
        });
        let def = workflow(json!({
            "name": "dry",
            "steps": [
                { "id": "models", "tool": "models" },
                { "id": "t", "tool": "template", "inputs": { "text": "{{ models.output }}" } }
            ]
        }));
        let result = engine(tools).run(&def, RunOptions::new().dry_run()).await.unwrap();

        assert_eq!(result.status, RunStatus::DryRun);
        assert_eq!(result.plan.layers, vec![vec!["models"], vec!["t"]]);
        assert!(result.output.is_null());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // -----------------------------------------------------------------------
    // Skipping
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_conditional_skips_untaken_branch() {
        let def = workflow(json!({
            "name": "branching",
            "steps": [
                { "id": "check", "tool": "template", "inputs": { "text": "hello" } },
                {
                    "id": "route",
                    "tool": "conditional",
                    "inputs": { "condition": "{{ check.output.charCount }} > 3", "then": ["long"], "else": ["short"] }
                },
                { "id": "long", "tool": "template", "inputs": { "text": "long" } },
                { "id": "short", "tool": "template", "inputs": { "text": "short" } }
            ]
        }));
        let recorder = Arc::new(Recorder::default());
        let result = engine(NoopTools)
            .run(&def, RunOptions::new().with_observer(recorder.clone()))
            .await
            .unwrap();

        assert_eq!(result.plan.layer_of("long"), Some(2));
        assert_eq!(result.skipped, vec!["short"]);
        let entry = result.context.get("short").unwrap();
        assert!(entry.skipped);
        assert_eq!(entry.reason, Some(REASON_BRANCH_NOT_TAKEN));
        assert_eq!(result.context.output("long").unwrap()["text"], "long");
        assert!(
            recorder
                .events()
                .contains(&"skipped:short:branch not taken".to_string())
        );
    }

    #[tokio::test]
    async fn test_step_condition_false_skips_step() {
        let def = workflow(json!({
            "name": "gated",
            "inputs": { "rerank": { "type": "boolean", "default": false } },
            "steps": [
                { "id": "t", "tool": "template", "inputs": { "text": "x" }, "condition": "{{ inputs.rerank }}" },
                { "id": "after", "tool": "template", "inputs": { "text": "[{{ t.output }}]" } }
            ]
        }));
        let result = engine(NoopTools).run(&def, RunOptions::new()).await.unwrap();

        assert_eq!(result.skipped, vec!["t"]);
        assert_eq!(
            result.context.get("t").unwrap().reason,
            Some(REASON_CONDITION_NOT_MET)
        );
        assert_eq!(result.context.output("after").unwrap()["text"], "[null]");
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_step_failure_aborts_run_with_step_id() {
        let def = workflow(json!({
            "name": "fails",
            "steps": [
                { "id": "embed", "tool": "embed", "inputs": { "text": "" } },
                { "id": "after", "tool": "template", "inputs": { "text": "{{ embed.output }}" } }
            ]
        }));
        let recorder = Arc::new(Recorder::default());
        let err = engine(search_tools())
            .run(&def, RunOptions::new().with_observer(recorder.clone()))
            .await
            .unwrap_err();

        match &err {
            ExecutorError::StepFailed { step_id, .. } => assert_eq!(step_id, "embed"),
            other => panic!("expected StepFailed, got: {other}"),
        }
        assert!(err.to_string().contains("nothing to embed"), "got: {err}");
        let events = recorder.events();
        assert!(events.contains(&"failed:embed:false".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("run_failed"));
        assert!(!events.iter().any(|e| e == "started:after"));
    }

    #[tokio::test]
    async fn test_continue_on_error_records_error_and_proceeds() {
        let def = workflow(json!({
            "name": "tolerant",
            "steps": [
                { "id": "embed", "tool": "embed", "inputs": { "text": "" }, "continueOnError": true },
                { "id": "after", "tool": "template", "inputs": { "text": "done" } }
            ]
        }));
        let result = engine(search_tools()).run(&def, RunOptions::new()).await.unwrap();

        let entry = result.context.get("embed").unwrap();
        assert!(entry.output.is_null());
        assert!(entry.error.unwrap().contains("nothing to embed"));
        assert_eq!(result.context.output("after").unwrap()["text"], "done");
    }

    #[tokio::test]
    async fn test_strict_validation_rejects_unknown_reference() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "name": "bad-ref",
            "steps": [
                { "id": "t", "tool": "template", "inputs": { "text": "{{ ghost.output }}" } }
            ]
        }))
        .unwrap();
        let err = engine(NoopTools).run(&def, RunOptions::new()).await.unwrap_err();

        match err {
            ExecutorError::Invalid(errors) => {
                assert!(errors.iter().any(|e| e.contains("ghost")), "got: {errors:?}");
            }
            other => panic!("expected Invalid, got: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_required_input_fails() {
        let def = workflow(json!({
            "name": "needs-input",
            "inputs": { "q": { "type": "string", "required": true } },
            "steps": [{ "id": "t", "tool": "template", "inputs": { "text": "{{ inputs.q }}" } }]
        }));
        let err = engine(NoopTools).run(&def, RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::MissingInput(ref name) if name == "q"));
    }

    // -----------------------------------------------------------------------
    // Iteration and projection
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_for_each_collects_results() {
        let def = workflow(json!({
            "name": "fan-out",
            "inputs": { "queries": { "type": "array", "required": true } },
            "defaults": { "collection": "docs" },
            "steps": [
                { "id": "s", "tool": "search", "forEach": "{{ inputs.queries }}", "inputs": { "query": "{{ item }}" } }
            ]
        }));
        let result = engine(search_tools())
            .run(
                &def,
                RunOptions::new()
                    .with_inputs(json!({ "queries": "alpha, beta" }))
                    .with_defaults(json!({ "collection": "papers" })),
            )
            .await
            .unwrap();

        let output = result.context.output("s").unwrap();
        assert_eq!(output["count"], 2);
        assert_eq!(output["results"][1]["results"][0]["id"], "beta-1");
        assert_eq!(output["results"][0]["collection"], "papers");
    }

    #[tokio::test]
    async fn test_for_each_non_array_source_fails() {
        let def = workflow(json!({
            "name": "fan-out",
            "inputs": { "q": { "type": "string", "default": "x" } },
            "steps": [
                { "id": "t", "tool": "template", "forEach": "{{ inputs.q }}", "inputs": { "text": "{{ item }}" } }
            ]
        }));
        let err = engine(NoopTools).run(&def, RunOptions::new()).await.unwrap_err();
        assert!(err.to_string().contains("did not resolve to an array"), "got: {err}");
    }

    #[tokio::test]
    async fn test_for_each_condition_is_evaluated_per_element() {
        let def = workflow(json!({
            "name": "fan-out",
            "inputs": { "numbers": { "type": "array", "default": [1, 2, 3] } },
            "steps": [
                {
                    "id": "t",
                    "tool": "template",
                    "forEach": "{{ inputs.numbers }}",
                    "condition": "item > 1",
                    "inputs": { "text": "{{ index }}:{{ item }}" }
                }
            ]
        }));
        let result = engine(NoopTools).run(&def, RunOptions::new()).await.unwrap();

        assert!(result.skipped.is_empty());
        let output = result.context.output("t").unwrap();
        assert_eq!(output["count"], 2);
        assert_eq!(output["results"][0]["text"], "1:2");
        assert_eq!(output["results"][1]["text"], "2:3");
    }

    #[tokio::test]
    async fn test_for_each_condition_matching_nothing_skips_step() {
        let def = workflow(json!({
            "name": "fan-out",
            "inputs": { "numbers": { "type": "array", "default": [1, 2, 3] } },
            "steps": [
                {
                    "id": "t",
                    "tool": "template",
                    "forEach": "{{ inputs.numbers }}",
                    "condition": "item > 10",
                    "inputs": { "text": "{{ item }}" }
                }
            ]
        }));
        let recorder = Arc::new(Recorder::default());
        let result = engine(NoopTools)
            .run(&def, RunOptions::new().with_observer(recorder.clone()))
            .await
            .unwrap();

        assert_eq!(result.skipped, vec!["t"]);
        assert_eq!(
            result.context.get("t").unwrap().reason,
            Some(REASON_CONDITION_NOT_MET)
        );
        assert!(
            recorder
                .events()
                .contains(&"skipped:t:condition not met".to_string())
        );
    }

    #[tokio::test]
    async fn test_loop_truncation_is_reported_in_output() {
        let def = workflow(json!({
            "name": "looping",
            "steps": [{
                "id": "each",
                "tool": "loop",
                "inputs": {
                    "items": ["a", "b", "c"],
                    "as": "letter",
                    "maxIterations": 2,
                    "step": { "tool": "template", "inputs": { "text": "{{ letter }}" } }
                }
            }],
            "output": "{{ each.output }}"
        }));
        let result = engine(NoopTools).run(&def, RunOptions::new()).await.unwrap();
        assert_eq!(result.output["iterations"], 2);
        assert_eq!(result.output["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_without_output_template_returns_full_context() {
        let def = workflow(json!({
            "name": "ctx",
            "steps": [{ "id": "t", "tool": "template", "inputs": { "text": "hi" } }]
        }));
        let result = engine(NoopTools).run(&def, RunOptions::new()).await.unwrap();
        assert_eq!(result.output["t"]["output"]["text"], "hi");
        assert!(result.output["inputs"].is_object());
    }

    #[tokio::test]
    async fn test_observer_sees_run_and_step_events_in_order() {
        let def = workflow(json!({
            "name": "observed",
            "steps": [
                { "id": "a", "tool": "template", "inputs": { "text": "a" } },
                { "id": "b", "tool": "template", "inputs": { "text": "{{ a.output.text }}" } }
            ]
        }));
        let recorder = Arc::new(Recorder::default());
        engine(NoopTools)
            .run(&def, RunOptions::new().with_observer(recorder.clone()))
            .await
            .unwrap();
        assert_eq!(
            recorder.events(),
            vec![
                "run_started:observed",
                "started:a",
                "completed:a",
                "started:b",
                "completed:b"
            ]
        );
    }

    // -----------------------------------------------------------------------
    // Input coercion
    // -----------------------------------------------------------------------

    #[test]
    fn test_inputs_are_coerced_to_declared_types() {
        let schema: BTreeMap<String, InputSchema> = serde_json::from_value(json!({
            "limit": { "type": "number" },
            "ratio": { "type": "number" },
            "verbose": { "type": "boolean" },
            "tags": { "type": "array" },
            "ids": { "type": "array" },
            "label": { "type": "string" },
            "fallback": { "type": "number", "default": 10 }
        }))
        .unwrap();
        let provided = json!({
            "limit": "5",
            "ratio": "0.5",
            "verbose": "true",
            "tags": "a, b,,c",
            "ids": "[1, 2]",
            "label": 42,
            "extra": "kept"
        });
        let resolved = resolve_run_inputs(&schema, provided.as_object().unwrap()).unwrap();

        assert_eq!(resolved["limit"], json!(5));
        assert_eq!(resolved["ratio"], json!(0.5));
        assert_eq!(resolved["verbose"], json!(true));
        assert_eq!(resolved["tags"], json!(["a", "b", "c"]));
        assert_eq!(resolved["ids"], json!([1, 2]));
        assert_eq!(resolved["label"], json!("42"));
        assert_eq!(resolved["fallback"], json!(10));
        assert_eq!(resolved["extra"], json!("kept"));
    }

    #[test]
    fn test_uncoercible_input_is_kept_as_provided() {
        let schema: BTreeMap<String, InputSchema> =
            serde_json::from_value(json!({ "limit": { "type": "number" } })).unwrap();
        let provided = json!({ "limit": "many" });
        let resolved = resolve_run_inputs(&schema, provided.as_object().unwrap()).unwrap();
        assert_eq!(resolved["limit"], json!("many"));
    }
}
