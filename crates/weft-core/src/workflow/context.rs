//! Run context with step output tracking and template resolution.
//!
//! `RunContext` is the state that flows through a single workflow run. It
//! holds the resolved run inputs, the merged defaults, and one entry per
//! finished step, laid out exactly as references see it:
//!
//! ```json
//! {
//!   "inputs":   { "query": "rust" },
//!   "defaults": { "collection": "docs" },
//!   "search":   { "output": { "results": [...] } },
//!   "rerank":   { "output": null, "skipped": true, "reason": "condition not met" }
//! }
//! ```

use serde::Serialize;
use serde_json::{Map, Value, json};
use weft_types::config::DEFAULT_MAX_STEP_OUTPUT_BYTES;

use super::expression::{Expression, Scope, resolve_path};
use super::references::{single_template_body, template_spans};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default maximum size of a single serialized step output.
pub const MAX_STEP_OUTPUT_SIZE: usize = DEFAULT_MAX_STEP_OUTPUT_BYTES;

// ---------------------------------------------------------------------------
// StepEntry
// ---------------------------------------------------------------------------

/// Borrowed view of what the context records for one step.
///
/// Serializes to the shape references see, e.g.
/// `{ "output": null, "skipped": true, "reason": "condition not met" }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepEntry<'a> {
    pub output: &'a Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

static NULL: Value = Value::Null;

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Per-run context. Each step ID is written at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    values: Map<String, Value>,
    max_output_bytes: usize,
}

impl RunContext {
    pub fn new(inputs: Map<String, Value>, defaults: Map<String, Value>) -> Self {
        let mut values = Map::new();
        values.insert("inputs".to_string(), Value::Object(inputs));
        values.insert("defaults".to_string(), Value::Object(defaults));
        Self {
            values,
            max_output_bytes: MAX_STEP_OUTPUT_SIZE,
        }
    }

    /// Override the per-output size guard.
    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Record the output of a completed step.
    ///
    /// Outputs whose serialized size exceeds the limit are replaced by a
    /// truncation marker.
    pub fn record_output(&mut self, step_id: &str, output: Value) {
        let output = self.guard_size(step_id, output);
        self.insert(
            step_id,
            StepEntry {
                output: &output,
                skipped: false,
                reason: None,
                error: None,
            },
        );
    }

    /// Record a skipped step with the reason it did not run.
    pub fn record_skipped(&mut self, step_id: &str, reason: &str) {
        self.insert(
            step_id,
            StepEntry {
                output: &NULL,
                skipped: true,
                reason: Some(reason),
                error: None,
            },
        );
    }

    /// Record a step that failed under `continueOnError`.
    pub fn record_error(&mut self, step_id: &str, error: &str) {
        self.insert(
            step_id,
            StepEntry {
                output: &NULL,
                skipped: false,
                reason: None,
                error: Some(error),
            },
        );
    }

    fn insert(&mut self, step_id: &str, entry: StepEntry<'_>) {
        if self.values.contains_key(step_id) {
            tracing::warn!(step_id, "step already recorded, keeping first entry");
            return;
        }
        let value = serde_json::to_value(&entry).unwrap_or(Value::Null);
        self.values.insert(step_id.to_string(), value);
    }

    fn guard_size(&self, step_id: &str, output: Value) -> Value {
        let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
        if size <= self.max_output_bytes {
            return output;
        }
        tracing::warn!(
            step_id,
            size,
            max = self.max_output_bytes,
            "step output exceeds size limit, truncating"
        );
        json!({
            "_truncated": true,
            "_original_size": size,
            "_message": format!(
                "output exceeded {} byte limit and was truncated",
                self.max_output_bytes
            )
        })
    }

    /// The recorded entry for a step, read in place.
    pub fn get(&self, step_id: &str) -> Option<StepEntry<'_>> {
        if matches!(step_id, "inputs" | "defaults") {
            return None;
        }
        let entry = self.values.get(step_id)?.as_object()?;
        Some(StepEntry {
            output: entry.get("output").unwrap_or(&NULL),
            skipped: entry.get("skipped").and_then(Value::as_bool).unwrap_or(false),
            reason: entry.get("reason").and_then(Value::as_str),
            error: entry.get("error").and_then(Value::as_str),
        })
    }

    /// The recorded output of a step (`null` for skipped or failed steps).
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        if matches!(step_id, "inputs" | "defaults") {
            return None;
        }
        self.values.get(step_id).and_then(|v| v.get("output"))
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        self.section("inputs")
    }

    pub fn defaults(&self) -> &Map<String, Value> {
        self.section("defaults")
    }

    fn section(&self, key: &str) -> &Map<String, Value> {
        static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
        self.values
            .get(key)
            .and_then(Value::as_object)
            .unwrap_or_else(|| EMPTY.get_or_init(Map::new))
    }

    /// IDs of every recorded step, in recording order.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.values
            .keys()
            .map(String::as_str)
            .filter(|k| !matches!(*k, "inputs" | "defaults"))
    }

    /// Borrowing scope for condition evaluation and template resolution.
    pub fn scope(&self) -> Scope<'_> {
        Scope::from_map(&self.values)
    }

    /// The full context as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

// ---------------------------------------------------------------------------
// Template resolution
// ---------------------------------------------------------------------------

/// Resolve every `{{ ... }}` template inside `value`.
///
/// - A string that is exactly one template becomes the referenced value with
///   its JSON type preserved. A body with operators evaluates to a boolean.
///   An unresolvable reference becomes `null`.
/// - A string mixing templates and text interpolates each resolved value as
///   display text and leaves unresolvable templates as written.
/// - Arrays and objects are resolved recursively; other values pass through.
pub fn resolve_templates(value: &Value, scope: &Scope<'_>) -> Value {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_templates(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_templates(v, scope)))
                .collect(),
        ),
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    }
}

/// Resolve the templates in every value of an inputs map.
pub fn resolve_inputs(inputs: &Map<String, Value>, scope: &Scope<'_>) -> Map<String, Value> {
    inputs
        .iter()
        .map(|(k, v)| (k.clone(), resolve_templates(v, scope)))
        .collect()
}

fn resolve_string(text: &str, scope: &Scope<'_>) -> Value {
    if let Some(body) = single_template_body(text) {
        return resolve_body(body, scope).unwrap_or(Value::Null);
    }

    let spans = template_spans(text);
    if spans.is_empty() {
        return Value::String(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        out.push_str(&text[cursor..span.start]);
        match resolve_body(span.body, scope) {
            Some(v) => out.push_str(&value_to_string(&v)),
            None => out.push_str(&text[span.start..span.end]),
        }
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    Value::String(out)
}

/// Resolve a template body: a plain path, a literal, or a condition.
fn resolve_body(body: &str, scope: &Scope<'_>) -> Option<Value> {
    if let Some(v) = resolve_path(body, scope) {
        return Some(v);
    }
    Expression::parse(body).ok()?.value(scope)
}

/// Convert a JSON value to a display string for template interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
