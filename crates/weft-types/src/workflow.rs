//! Workflow domain types for weft.
//!
//! Defines the canonical representation of a workflow definition (the wire and
//! file contract), the closed set of step kinds, validation report types, and
//! the execution plan produced by the planner.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// JSON and YAML files both deserialize into this struct. Step order is an
/// authoring convenience only; execution order comes from the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow name. Required for a clean run, advisory in draft validation.
    #[serde(default)]
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Declared run inputs keyed by input name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSchema>,
    /// Fallback values consumed by tool steps (e.g. a default collection).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub defaults: Map<String, Value>,
    /// Step definitions.
    pub steps: Vec<StepDefinition>,
    /// Output template projected from the final context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Display hints for front ends. Never interpreted by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatters: Option<Formatters>,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Schema for a single declared workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InputSchema {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared type of a workflow input, used for simple coercion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Array,
}

/// Display hints for rendering workflow results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Formatters {
    #[serde(rename = "default", default, skip_serializing_if = "Option::is_none")]
    pub default_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique identifier, referenced as `{{ <id>.output }}` by other steps.
    pub id: String,
    /// The kind of step. Accepts `kind` as an alias.
    #[serde(alias = "kind")]
    pub tool: StepKind,
    /// Human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Step inputs; string values may embed `{{ ... }}` references.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Skip the step (not fail) when this evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Reference resolving to an array; the step runs once per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    /// Record a failure and keep going instead of aborting the run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,
}

impl StepDefinition {
    /// Create a step with no inputs.
    pub fn new(id: impl Into<String>, tool: StepKind) -> Self {
        Self {
            id: id.into(),
            tool,
            name: None,
            inputs: Map::new(),
            condition: None,
            for_each: None,
            continue_on_error: false,
        }
    }

    /// Builder-style setter for the step inputs.
    ///
    /// Non-object values are ignored.
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        if let Value::Object(map) = inputs {
            self.inputs = map;
        }
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_for_each(mut self, source: impl Into<String>) -> Self {
        self.for_each = Some(source.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// The closed set of step kinds.
///
/// Control-flow kinds are executed by the engine itself. Tool kinds are
/// delegated to a pluggable executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    // Control flow
    Merge,
    Filter,
    Transform,
    Conditional,
    Loop,
    Template,
    // Tools
    Query,
    Search,
    Rerank,
    Embed,
    Similarity,
    Ingest,
    Collections,
    Models,
    Explain,
    Estimate,
    Generate,
    Chunk,
    Aggregate,
    Http,
}

impl StepKind {
    /// Every known kind, control flow first.
    pub const ALL: [StepKind; 20] = [
        StepKind::Merge,
        StepKind::Filter,
        StepKind::Transform,
        StepKind::Conditional,
        StepKind::Loop,
        StepKind::Template,
        StepKind::Query,
        StepKind::Search,
        StepKind::Rerank,
        StepKind::Embed,
        StepKind::Similarity,
        StepKind::Ingest,
        StepKind::Collections,
        StepKind::Models,
        StepKind::Explain,
        StepKind::Estimate,
        StepKind::Generate,
        StepKind::Chunk,
        StepKind::Aggregate,
        StepKind::Http,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Merge => "merge",
            StepKind::Filter => "filter",
            StepKind::Transform => "transform",
            StepKind::Conditional => "conditional",
            StepKind::Loop => "loop",
            StepKind::Template => "template",
            StepKind::Query => "query",
            StepKind::Search => "search",
            StepKind::Rerank => "rerank",
            StepKind::Embed => "embed",
            StepKind::Similarity => "similarity",
            StepKind::Ingest => "ingest",
            StepKind::Collections => "collections",
            StepKind::Models => "models",
            StepKind::Explain => "explain",
            StepKind::Estimate => "estimate",
            StepKind::Generate => "generate",
            StepKind::Chunk => "chunk",
            StepKind::Aggregate => "aggregate",
            StepKind::Http => "http",
        }
    }

    /// Parse a kind from its wire name.
    pub fn from_name(name: &str) -> Option<StepKind> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Whether the engine executes this kind itself.
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            StepKind::Merge
                | StepKind::Filter
                | StepKind::Transform
                | StepKind::Conditional
                | StepKind::Loop
                | StepKind::Template
        )
    }

    /// Kinds that take no arguments and may omit `inputs` entirely.
    pub fn may_omit_inputs(self) -> bool {
        matches!(self, StepKind::Collections | StepKind::Models)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// Which reporting mode the validator runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Flat list of fatal error strings.
    #[default]
    Strict,
    /// Severity-tagged issues for incremental authoring.
    Draft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single issue found while validating a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: Severity,
    /// `None` for workflow-level issues.
    pub step_id: Option<String>,
    /// Stable machine-readable code, e.g. `UNKNOWN_STEP_REF`.
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_step: Option<String>,
}

/// Aggregate counts for a draft validation report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub total_steps: usize,
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
}

/// Draft-mode validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when no `error`-severity issue was found.
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub stats: ValidationStats,
}

impl ValidationReport {
    /// Issues with the given code.
    pub fn issues_with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a ValidationIssue> {
        self.issues.iter().filter(move |i| i.code == code)
    }
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Ordered layers of step IDs. Steps within a layer are mutually independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionPlan {
    pub layers: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// All step IDs in layer order.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().flatten().map(String::as_str)
    }

    /// Index of the layer containing `step_id`.
    pub fn layer_of(&self, step_id: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|id| id == step_id))
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Planned only, nothing executed.
    DryRun,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
