//! Workflow definition parsing, serialization, and filesystem operations.
//!
//! Converts between JSON/YAML text and the canonical `WorkflowDefinition`.
//! Every parse runs strict validation over the raw structured value first, so
//! malformed shapes are reported with validator messages rather than serde
//! errors, and a returned definition is always runnable.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use weft_types::workflow::WorkflowDefinition;

use super::validator::validate_strict;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading, validating, or planning a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Strict validation failed; one message per issue, in check order.
    #[error("validation error: {}", .0.join("; "))]
    ValidationError(Vec<String>),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// File extension is not one of `json`, `yaml`, `yml`.
    #[error("unsupported workflow file extension: {0}")]
    UnsupportedFormat(String),

    /// Kahn layering found steps that can never become ready.
    #[error("execution plan stalled with unresolved steps: {}", remaining.join(", "))]
    PlanStalled { remaining: Vec<String> },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Validate a raw structured value and convert it into a definition.
pub fn definition_from_value(value: Value) -> Result<WorkflowDefinition, WorkflowError> {
    let errors = validate_strict(&value);
    if !errors.is_empty() {
        return Err(WorkflowError::ValidationError(errors));
    }
    serde_json::from_value(value).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    definition_from_value(value)
}

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let value: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    definition_from_value(value)
}

/// Serialize a `WorkflowDefinition` to pretty-printed JSON.
pub fn serialize_workflow_json(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_json::to_string_pretty(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// JSON Schema describing the definition file format.
pub fn workflow_json_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(WorkflowDefinition)).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Result<FileFormat, WorkflowError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(FileFormat::Json),
        Some("yaml" | "yml") => Ok(FileFormat::Yaml),
        other => Err(WorkflowError::UnsupportedFormat(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Load a workflow definition from a `.json`, `.yaml`, or `.yml` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let format = format_of(path)?;
    let content = std::fs::read_to_string(path)?;
    match format {
        FileFormat::Json => parse_workflow_json(&content),
        FileFormat::Yaml => parse_workflow_yaml(&content),
    }
}

/// Save a workflow definition, picking the format from the file extension.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let text = match format_of(path)? {
        FileFormat::Json => serialize_workflow_json(def)?,
        FileFormat::Yaml => serialize_workflow_yaml(def)?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    Ok(())
}

/// Discover all workflow files under `base_dir`.
///
/// Scans for `.json`, `.yaml`, and `.yml` files recursively. Files that fail
/// to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if format_of(&path).is_ok() {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
