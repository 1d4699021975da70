//! Step dispatcher for every step kind.
//!
//! `StepRunner` matches exhaustively over `StepKind`. Control-flow kinds are
//! handled in-process (see `control_flow`), `loop` re-enters the dispatcher
//! once per element, and tool kinds are delegated to a pluggable
//! [`ToolExecutor`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use weft_types::workflow::StepKind;

use super::context::{resolve_inputs, resolve_templates};
use super::control_flow;
use super::expression::{Scope, resolve_path};

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// A built-in kind received inputs of the wrong shape.
    #[error("invalid input for {kind} step: {message}")]
    InvalidInput { kind: StepKind, message: String },

    /// No executor handles this tool kind.
    #[error("no executor registered for tool \"{0}\"")]
    NoExecutor(StepKind),

    /// A tool executor reported a failure.
    #[error("{kind} tool failed: {message}")]
    Tool { kind: StepKind, message: String },

    /// `forEach` did not resolve to an array.
    #[error("forEach source \"{0}\" did not resolve to an array")]
    ForEachSource(String),

    /// One `forEach` element failed; the step fails with it.
    #[error("forEach item {index} failed: {source}")]
    ForEachItem {
        index: usize,
        #[source]
        source: Box<StepError>,
    },
}

impl StepError {
    /// Convenience constructor for tool implementations.
    pub fn tool(kind: StepKind, message: impl Into<String>) -> Self {
        StepError::Tool {
            kind,
            message: message.into(),
        }
    }

    fn invalid(kind: StepKind, message: impl Into<String>) -> Self {
        StepError::InvalidInput {
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolExecutor
// ---------------------------------------------------------------------------

/// Read-only view of the run handed to tool executors.
#[derive(Debug, Clone, Copy)]
pub struct ToolEnv<'a> {
    scope: &'a Scope<'a>,
}

impl<'a> ToolEnv<'a> {
    pub fn new(scope: &'a Scope<'a>) -> Self {
        Self { scope }
    }

    /// The merged workflow defaults.
    pub fn defaults(&self) -> Option<&'a Map<String, Value>> {
        match self.scope.get("defaults") {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// A single default value, e.g. the fallback collection.
    pub fn default_value(&self, key: &str) -> Option<&'a Value> {
        self.defaults().and_then(|d| d.get(key))
    }

    /// Resolve a dotted path against the live context.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        resolve_path(path, self.scope)
    }

    pub fn scope(&self) -> &'a Scope<'a> {
        self.scope
    }
}

/// Executes tool step kinds on behalf of the engine.
///
/// Receives resolved inputs and returns the step output. The engine never
/// inspects tool outputs beyond what workflow references select.
pub trait ToolExecutor: Send + Sync {
    fn execute(
        &self,
        kind: StepKind,
        inputs: &Value,
        env: &ToolEnv<'_>,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

impl<T: ToolExecutor> ToolExecutor for Arc<T> {
    fn execute(
        &self,
        kind: StepKind,
        inputs: &Value,
        env: &ToolEnv<'_>,
    ) -> impl Future<Output = Result<Value, StepError>> + Send {
        (**self).execute(kind, inputs, env)
    }
}

/// Executor with no tools: every tool kind fails with `NoExecutor`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTools;

impl ToolExecutor for NoopTools {
    async fn execute(&self, kind: StepKind, _inputs: &Value, _env: &ToolEnv<'_>) -> Result<Value, StepError> {
        Err(StepError::NoExecutor(kind))
    }
}

type ToolFn = dyn Fn(&Value, &ToolEnv<'_>) -> Result<Value, StepError> + Send + Sync;

/// Per-kind tool functions, used to substitute deterministic mocks for real
/// collaborators.
///
/// ```
/// use serde_json::json;
/// use weft_core::workflow::step_runner::ToolRegistry;
/// use weft_types::workflow::StepKind;
///
/// let tools = ToolRegistry::new()
///     .register(StepKind::Search, |inputs, _env| Ok(json!({ "query": inputs["query"] })));
/// assert!(tools.handles(StepKind::Search));
/// ```
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<StepKind, Arc<ToolFn>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the function for a kind.
    pub fn register<F>(mut self, kind: StepKind, f: F) -> Self
    where
        F: Fn(&Value, &ToolEnv<'_>) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.tools.insert(kind, Arc::new(f));
        self
    }

    pub fn handles(&self, kind: StepKind) -> bool {
        self.tools.contains_key(&kind)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<StepKind> = self.tools.keys().copied().collect();
        kinds.sort();
        f.debug_struct("ToolRegistry").field("kinds", &kinds).finish()
    }
}

impl ToolExecutor for ToolRegistry {
    async fn execute(&self, kind: StepKind, inputs: &Value, env: &ToolEnv<'_>) -> Result<Value, StepError> {
        match self.tools.get(&kind) {
            Some(f) => f(inputs, env),
            None => Err(StepError::NoExecutor(kind)),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub use weft_types::config::DEFAULT_MAX_LOOP_ITERATIONS;

/// Dispatches a step to its handler.
pub struct StepRunner<'e, E> {
    executor: &'e E,
    max_loop_iterations: u32,
}

impl<'e, E: ToolExecutor> StepRunner<'e, E> {
    pub fn new(executor: &'e E, max_loop_iterations: u32) -> Self {
        Self {
            executor,
            max_loop_iterations,
        }
    }

    /// Resolve `inputs` as the kind requires and run the step.
    ///
    /// `conditional` keeps `condition`, `then`, and `else` unresolved;
    /// `filter` keeps `condition`; `loop` resolves only `items` up front and
    /// resolves its nested step per iteration.
    pub fn dispatch<'a>(
        &'a self,
        kind: StepKind,
        inputs: &'a Map<String, Value>,
        scope: &'a Scope<'a>,
    ) -> BoxFuture<'a, Result<Value, StepError>> {
        Box::pin(async move {
            match kind {
                StepKind::Merge => control_flow::merge(&resolve_inputs(inputs, scope)),
                StepKind::Filter => {
                    let resolved = resolve_except(inputs, scope, &["condition"]);
                    control_flow::filter(&resolved, scope)
                }
                StepKind::Transform => control_flow::transform(&resolve_inputs(inputs, scope)),
                StepKind::Conditional => {
                    let resolved = resolve_except(inputs, scope, &["condition", "then", "else"]);
                    control_flow::conditional(&resolved, scope).map(|d| d.to_value())
                }
                StepKind::Template => control_flow::template(&resolve_inputs(inputs, scope)),
                StepKind::Loop => self.run_loop(inputs, scope).await,
                StepKind::Query
                | StepKind::Search
                | StepKind::Rerank
                | StepKind::Embed
                | StepKind::Similarity
                | StepKind::Ingest
                | StepKind::Collections
                | StepKind::Models
                | StepKind::Explain
                | StepKind::Estimate
                | StepKind::Generate
                | StepKind::Chunk
                | StepKind::Aggregate
                | StepKind::Http => {
                    let resolved = Value::Object(resolve_inputs(inputs, scope));
                    let env = ToolEnv::new(scope);
                    tracing::debug!(tool = %kind, "dispatching tool step");
                    self.executor.execute(kind, &resolved, &env).await
                }
            }
        })
    }

    // -- Loop: iterate a nested step over items, collecting per-item errors --

    async fn run_loop(&self, inputs: &Map<String, Value>, scope: &Scope<'_>) -> Result<Value, StepError> {
        let items = inputs
            .get("items")
            .map(|raw| resolve_templates(raw, scope))
            .ok_or_else(|| StepError::invalid(StepKind::Loop, "\"items\" is required"))?;
        let items = items
            .as_array()
            .ok_or_else(|| StepError::invalid(StepKind::Loop, "\"items\" must resolve to an array"))?;
        let binding = inputs
            .get("as")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::invalid(StepKind::Loop, "\"as\" must name the loop variable"))?;
        let nested = inputs
            .get("step")
            .and_then(Value::as_object)
            .ok_or_else(|| StepError::invalid(StepKind::Loop, "\"step\" must be a step definition"))?;
        let nested_kind = nested
            .get("tool")
            .or_else(|| nested.get("kind"))
            .and_then(Value::as_str)
            .and_then(StepKind::from_name)
            .ok_or_else(|| StepError::invalid(StepKind::Loop, "nested step has an unknown tool"))?;
        let no_inputs = Map::new();
        let nested_inputs = nested
            .get("inputs")
            .and_then(Value::as_object)
            .unwrap_or(&no_inputs);
        let max = inputs
            .get("maxIterations")
            .and_then(Value::as_u64)
            .map_or(self.max_loop_iterations as usize, |n| n as usize);

        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut iterations = 0usize;

        for (index, item) in items.iter().take(max).enumerate() {
            let iteration_scope = scope
                .clone()
                .bind("item", item.clone())
                .bind(binding, item.clone())
                .bind("index", json!(index));
            match self.dispatch(nested_kind, nested_inputs, &iteration_scope).await {
                Ok(output) => results.push(output),
                Err(e) => {
                    tracing::debug!(index, error = %e, "loop iteration failed");
                    errors.push(json!({ "index": index, "error": e.to_string() }));
                }
            }
            iterations += 1;
        }

        if items.len() > max {
            tracing::warn!(items = items.len(), max, "loop hit max iterations cap");
            errors.push(json!({
                "index": max,
                "error": format!(
                    "Loop truncated: {} items exceeds maxIterations of {}",
                    items.len(),
                    max
                ),
            }));
        }

        Ok(json!({
            "iterations": iterations,
            "resultCount": results.len(),
            "results": results,
            "errors": errors,
        }))
    }
}

/// Resolve every input except `deferred` keys, which are copied as written.
fn resolve_except(inputs: &Map<String, Value>, scope: &Scope<'_>, deferred: &[&str]) -> Map<String, Value> {
    inputs
        .iter()
        .map(|(k, v)| {
            let value = if deferred.contains(&k.as_str()) {
                v.clone()
            } else {
                resolve_templates(v, scope)
            };
            (k.clone(), value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn echo_tools() -> ToolRegistry {
        ToolRegistry::new()
            .register(StepKind::Embed, |inputs, _env| {
                let text = inputs["text"].as_str().unwrap_or_default();
                if text.is_empty() {
                    return Err(StepError::tool(StepKind::Embed, "empty text"));
                }
                Ok(json!({ "vector": [text.len()] }))
            })
            .register(StepKind::Search, |inputs, env| {
                let collection = inputs
                    .get("collection")
                    .cloned()
                    .or_else(|| env.default_value("collection").cloned())
                    .unwrap_or(Value::Null);
                Ok(json!({ "query": inputs["query"], "collection": collection }))
            })
    }

    // -----------------------------------------------------------------------
    // Tool dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn test_default_loop_cap_matches_engine_config() {
        let config = weft_types::config::EngineConfig::default();
        assert_eq!(DEFAULT_MAX_LOOP_ITERATIONS, config.max_loop_iterations);
    }

    #[tokio::test]
    async fn test_tool_step_receives_resolved_inputs_and_defaults() {
        let ctx = json!({ "inputs": { "q": "rust" }, "defaults": { "collection": "docs" } });
        let scope = Scope::new(&ctx);
        let tools = echo_tools();
        let runner = StepRunner::new(&tools, DEFAULT_MAX_LOOP_ITERATIONS);

        let inputs = map(json!({ "query": "{{ inputs.q }}" }));
        let out = runner.dispatch(StepKind::Search, &inputs, &scope).await.unwrap();
        assert_eq!(out, json!({ "query": "rust", "collection": "docs" }));
    }

    #[tokio::test]
    async fn test_unregistered_tool_fails_with_no_executor() {
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        let tools = echo_tools();
        let runner = StepRunner::new(&tools, DEFAULT_MAX_LOOP_ITERATIONS);

        let err = runner
            .dispatch(StepKind::Generate, &Map::new(), &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::NoExecutor(StepKind::Generate)));
        assert!(err.to_string().contains("generate"), "got: {err}");
    }

    #[tokio::test]
    async fn test_noop_tools_reject_everything_but_control_flow() {
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&NoopTools, DEFAULT_MAX_LOOP_ITERATIONS);

        assert!(runner.dispatch(StepKind::Models, &Map::new(), &scope).await.is_err());
        let out = runner
            .dispatch(StepKind::Template, &map(json!({ "text": "ok" })), &scope)
            .await
            .unwrap();
        assert_eq!(out["text"], "ok");
    }

    #[tokio::test]
    async fn test_arc_executor_delegates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tools = Arc::new(ToolRegistry::new().register(StepKind::Models, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(["m1"]))
        }));
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&tools, DEFAULT_MAX_LOOP_ITERATIONS);
        runner.dispatch(StepKind::Models, &Map::new(), &scope).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // -----------------------------------------------------------------------
    // Deferred resolution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_conditional_condition_is_not_eagerly_resolved() {
        let ctx = json!({ "check": { "output": { "count": 2 } } });
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&NoopTools, DEFAULT_MAX_LOOP_ITERATIONS);
        let inputs = map(json!({
            "condition": "{{ check.output.count }} > 1",
            "then": ["a"],
            "else": ["b"]
        }));
        let out = runner.dispatch(StepKind::Conditional, &inputs, &scope).await.unwrap();
        assert_eq!(out["branchTaken"], "then");
        assert_eq!(out["skippedSteps"], json!(["b"]));
    }

    #[tokio::test]
    async fn test_filter_condition_templates_see_item() {
        let ctx = json!({ "search": { "output": { "results": [{ "s": 1 }, { "s": 9 }] } } });
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&NoopTools, DEFAULT_MAX_LOOP_ITERATIONS);
        let inputs = map(json!({
            "array": "{{ search.output.results }}",
            "condition": "{{ item.s > 5 }}"
        }));
        let out = runner.dispatch(StepKind::Filter, &inputs, &scope).await.unwrap();
        assert_eq!(out["results"], json!([{ "s": 9 }]));
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_loop_truncates_at_max_iterations() {
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&NoopTools, DEFAULT_MAX_LOOP_ITERATIONS);
        let inputs = map(json!({
            "items": ["x", "y", "z"],
            "as": "letter",
            "maxIterations": 2,
            "step": { "tool": "template", "inputs": { "text": "{{ index }}:{{ letter }}" } }
        }));
        let out = runner.dispatch(StepKind::Loop, &inputs, &scope).await.unwrap();
        assert_eq!(out["iterations"], 2);
        assert_eq!(out["resultCount"], 2);
        assert_eq!(out["results"][1]["text"], "1:y");
        let errors = out["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(
            errors[0]["error"].as_str().unwrap().contains("truncated"),
            "got: {errors:?}"
        );
    }

    #[tokio::test]
    async fn test_loop_records_item_failures_and_continues() {
        let ctx = json!({ "docs": { "output": { "items": ["alpha", "", "gamma"] } } });
        let scope = Scope::new(&ctx);
        let tools = echo_tools();
        let runner = StepRunner::new(&tools, DEFAULT_MAX_LOOP_ITERATIONS);
        let inputs = map(json!({
            "items": "{{ docs.output.items }}",
            "as": "doc",
            "step": { "tool": "embed", "inputs": { "text": "{{ doc }}" } }
        }));
        let out = runner.dispatch(StepKind::Loop, &inputs, &scope).await.unwrap();
        assert_eq!(out["iterations"], 3);
        assert_eq!(out["results"], json!([{ "vector": [5] }, { "vector": [5] }]));
        assert_eq!(out["errors"][0]["index"], 1);
        assert!(out["errors"][0]["error"].as_str().unwrap().contains("empty text"));
    }

    #[tokio::test]
    async fn test_loop_uses_configured_default_cap() {
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&NoopTools, 1);
        let inputs = map(json!({
            "items": [1, 2],
            "as": "n",
            "step": { "kind": "template", "inputs": { "text": "{{ n }}" } }
        }));
        let out = runner.dispatch(StepKind::Loop, &inputs, &scope).await.unwrap();
        assert_eq!(out["iterations"], 1);
        assert_eq!(out["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nested_loop_reenters_dispatcher() {
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&NoopTools, DEFAULT_MAX_LOOP_ITERATIONS);
        let inputs = map(json!({
            "items": [[1, 2], [3]],
            "as": "row",
            "step": {
                "tool": "loop",
                "inputs": {
                    "items": "{{ row }}",
                    "as": "cell",
                    "step": { "tool": "template", "inputs": { "text": "{{ cell }}" } }
                }
            }
        }));
        let out = runner.dispatch(StepKind::Loop, &inputs, &scope).await.unwrap();
        assert_eq!(out["results"][0]["resultCount"], 2);
        assert_eq!(out["results"][1]["results"][0]["text"], "3");
    }

    #[tokio::test]
    async fn test_loop_rejects_non_array_items() {
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        let runner = StepRunner::new(&NoopTools, DEFAULT_MAX_LOOP_ITERATIONS);
        let inputs = map(json!({
            "items": "not a list",
            "as": "x",
            "step": { "tool": "template", "inputs": { "text": "x" } }
        }));
        let err = runner.dispatch(StepKind::Loop, &inputs, &scope).await.unwrap_err();
        assert!(err.to_string().contains("items"), "got: {err}");
    }
}
