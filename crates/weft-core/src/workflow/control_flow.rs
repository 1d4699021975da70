//! Built-in control-flow step kinds: merge, filter, transform, conditional,
//! and template.
//!
//! Each handler takes the step's inputs (already template-resolved, except the
//! deferred keys noted per kind) and returns the step output. `loop` lives in
//! the step runner because it re-enters the dispatcher.

use std::collections::HashSet;

use serde_json::{Map, Value, json};
use weft_types::workflow::StepKind;

use super::context::value_to_string;
use super::expression::{Scope, evaluate_in};
use super::step_runner::StepError;

/// Which branch a conditional step took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchDecision {
    pub condition_result: bool,
    pub enabled_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
}

impl BranchDecision {
    pub fn branch_taken(&self) -> &'static str {
        if self.condition_result { "then" } else { "else" }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "conditionResult": self.condition_result,
            "branchTaken": self.branch_taken(),
            "enabledSteps": self.enabled_steps,
            "skippedSteps": self.skipped_steps,
        })
    }
}

fn invalid(kind: StepKind, message: impl Into<String>) -> StepError {
    StepError::InvalidInput {
        kind,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Concatenate `arrays`, optionally dropping later duplicates.
///
/// `dedup: "<field>"` or `dedup: true` with `dedupField` keys on a field;
/// `dedup: true` alone compares whole elements. Elements without the field
/// are always kept.
pub fn merge(inputs: &Map<String, Value>) -> Result<Value, StepError> {
    let arrays = inputs
        .get("arrays")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(StepKind::Merge, "\"arrays\" must be an array of arrays"))?;

    let dedup = match inputs.get("dedup") {
        Some(Value::String(field)) => Some(Some(field.as_str())),
        Some(Value::Bool(true)) => Some(inputs.get("dedupField").and_then(Value::as_str)),
        _ => None,
    };

    let mut results = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for item in arrays.iter().filter_map(Value::as_array).flatten() {
        if let Some(field) = dedup {
            let key = match field {
                Some(field) => item.get(field).map(|v| v.to_string()),
                None => Some(item.to_string()),
            };
            if let Some(key) = key {
                if !seen.insert(key) {
                    continue;
                }
            }
        }
        results.push(item.clone());
    }

    Ok(json!({
        "resultCount": results.len(),
        "results": results,
    }))
}

// ---------------------------------------------------------------------------
// filter
// ---------------------------------------------------------------------------

/// Keep the elements of `array` for which `condition` holds.
///
/// Each element is bound as `item` and its position as `index`. The condition
/// is not template-resolved ahead of time.
pub fn filter(inputs: &Map<String, Value>, scope: &Scope<'_>) -> Result<Value, StepError> {
    let array = inputs
        .get("array")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(StepKind::Filter, "\"array\" must be an array"))?;
    let condition = inputs
        .get("condition")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(StepKind::Filter, "\"condition\" must be a string"))?;

    let results: Vec<Value> = array
        .iter()
        .enumerate()
        .filter(|(index, item)| {
            let item_scope = scope
                .clone()
                .bind("item", (*item).clone())
                .bind("index", json!(index));
            evaluate_in(condition, &item_scope)
        })
        .map(|(_, item)| item.clone())
        .collect();

    Ok(json!({
        "resultCount": results.len(),
        "inputCount": array.len(),
        "results": results,
    }))
}

// ---------------------------------------------------------------------------
// transform
// ---------------------------------------------------------------------------

/// Project (`fields`) or reshape (`mapping`) each element of `array`.
///
/// A `mapping` value naming an existing source field copies that field;
/// any other value is written as a literal. With neither option the array
/// passes through.
pub fn transform(inputs: &Map<String, Value>) -> Result<Value, StepError> {
    let array = inputs
        .get("array")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(StepKind::Transform, "\"array\" must be an array"))?;

    let results: Vec<Value> = if let Some(fields) = inputs.get("fields").and_then(Value::as_array) {
        let fields: Vec<&str> = fields.iter().filter_map(Value::as_str).collect();
        array
            .iter()
            .map(|item| match item.as_object() {
                Some(obj) => Value::Object(
                    fields
                        .iter()
                        .filter_map(|f| obj.get(*f).map(|v| (f.to_string(), v.clone())))
                        .collect(),
                ),
                None => item.clone(),
            })
            .collect()
    } else if let Some(mapping) = inputs.get("mapping").and_then(Value::as_object) {
        array
            .iter()
            .map(|item| {
                let source = item.as_object();
                Value::Object(
                    mapping
                        .iter()
                        .map(|(target, rule)| {
                            let copied = rule
                                .as_str()
                                .and_then(|name| source.and_then(|s| s.get(name)));
                            (target.clone(), copied.unwrap_or(rule).clone())
                        })
                        .collect(),
                )
            })
            .collect()
    } else {
        array.clone()
    };

    Ok(json!({
        "resultCount": results.len(),
        "results": results,
    }))
}

// ---------------------------------------------------------------------------
// conditional
// ---------------------------------------------------------------------------

/// Decide a conditional's branch against the live context.
///
/// `condition` may be a boolean or an expression string; `then` and `else`
/// are step ID lists and are never template-resolved.
pub fn conditional(inputs: &Map<String, Value>, scope: &Scope<'_>) -> Result<BranchDecision, StepError> {
    let condition_result = match inputs.get("condition") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(expr)) => evaluate_in(expr, scope),
        _ => {
            return Err(invalid(
                StepKind::Conditional,
                "\"condition\" must be a boolean or expression string",
            ));
        }
    };

    let ids = |key: &str| -> Result<Vec<String>, StepError> {
        match inputs.get(key) {
            None | Some(Value::Null) if key == "else" => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid(StepKind::Conditional, format!("\"{key}\" must list step ids")))
                })
                .collect(),
            _ => Err(invalid(StepKind::Conditional, format!("\"{key}\" must be an array"))),
        }
    };
    let then_steps = ids("then")?;
    let else_steps = ids("else")?;

    let (enabled_steps, skipped_steps) = if condition_result {
        (then_steps, else_steps)
    } else {
        (else_steps, then_steps)
    };

    tracing::debug!(
        result = condition_result,
        skipped = ?skipped_steps,
        "conditional branch selected"
    );

    Ok(BranchDecision {
        condition_result,
        enabled_steps,
        skipped_steps,
    })
}

// ---------------------------------------------------------------------------
// template
// ---------------------------------------------------------------------------

/// Render `text` to a string and report its length in characters.
pub fn template(inputs: &Map<String, Value>) -> Result<Value, StepError> {
    let text = inputs
        .get("text")
        .map(value_to_string)
        .ok_or_else(|| invalid(StepKind::Template, "\"text\" is required"))?;
    Ok(json!({
        "charCount": text.chars().count(),
        "text": text,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    // -----------------------------------------------------------------------
    // merge
    // -----------------------------------------------------------------------

    #[test]
    fn test_merge_concatenates() {
        let out = merge(&map(json!({ "arrays": [[1, 2], [3, 4]] }))).unwrap();
        assert_eq!(out, json!({ "results": [1, 2, 3, 4], "resultCount": 4 }));
    }

    #[test]
    fn test_merge_skips_non_arrays() {
        let out = merge(&map(json!({ "arrays": [[1], null, "x", [2]] }))).unwrap();
        assert_eq!(out["results"], json!([1, 2]));
    }

    #[test]
    fn test_merge_dedup_by_field_keeps_first() {
        let out = merge(&map(json!({
            "arrays": [
                [{ "id": "a", "src": 1 }, { "id": "b", "src": 1 }],
                [{ "id": "a", "src": 2 }, { "id": "c", "src": 2 }, { "other": true }]
            ],
            "dedup": "id"
        })))
        .unwrap();
        assert_eq!(
            out["results"],
            json!([{ "id": "a", "src": 1 }, { "id": "b", "src": 1 }, { "id": "c", "src": 2 }, { "other": true }])
        );
        assert_eq!(out["resultCount"], 4);
    }

    #[test]
    fn test_merge_dedup_flag_with_field_and_whole_value() {
        let by_field = merge(&map(json!({
            "arrays": [[{ "k": 1, "v": "x" }], [{ "k": 1, "v": "y" }]],
            "dedup": true,
            "dedupField": "k"
        })))
        .unwrap();
        assert_eq!(by_field["resultCount"], 1);

        let whole = merge(&map(json!({ "arrays": [[1, 2], [2, 3]], "dedup": true }))).unwrap();
        assert_eq!(whole["results"], json!([1, 2, 3]));
    }

    #[test]
    fn test_merge_requires_arrays() {
        let err = merge(&map(json!({ "arrays": "nope" }))).unwrap_err();
        assert!(err.to_string().contains("arrays"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // filter
    // -----------------------------------------------------------------------

    #[test]
    fn test_filter_by_item_score() {
        let ctx = json!({});
        let out = filter(
            &map(json!({
                "array": [{ "score": 0.9 }, { "score": 0.5 }],
                "condition": "item.score > 0.7"
            })),
            &Scope::new(&ctx),
        )
        .unwrap();
        assert_eq!(
            out,
            json!({ "results": [{ "score": 0.9 }], "resultCount": 1, "inputCount": 2 })
        );
    }

    #[test]
    fn test_filter_sees_context_and_index() {
        let ctx = json!({ "inputs": { "min": 2 } });
        let out = filter(
            &map(json!({ "array": [5, 1, 7, 3], "condition": "item > inputs.min && index > 0" })),
            &Scope::new(&ctx),
        )
        .unwrap();
        assert_eq!(out["results"], json!([7, 3]));
    }

    #[test]
    fn test_filter_rejects_wrong_types() {
        let ctx = json!({});
        let scope = Scope::new(&ctx);
        assert!(filter(&map(json!({ "array": {}, "condition": "true" })), &scope).is_err());
        assert!(filter(&map(json!({ "array": [], "condition": 1 })), &scope).is_err());
    }

    // -----------------------------------------------------------------------
    // transform
    // -----------------------------------------------------------------------

    #[test]
    fn test_transform_fields_projection() {
        let out = transform(&map(json!({
            "array": [{ "id": 1, "title": "a", "body": "x" }, { "id": 2 }],
            "fields": ["id", "title"]
        })))
        .unwrap();
        assert_eq!(out["results"], json!([{ "id": 1, "title": "a" }, { "id": 2 }]));
    }

    #[test]
    fn test_transform_mapping_renames_and_literals() {
        let out = transform(&map(json!({
            "array": [{ "id": 1, "title": "a" }],
            "mapping": { "key": "id", "label": "title", "source": "search", "rank": 1 }
        })))
        .unwrap();
        assert_eq!(
            out["results"],
            json!([{ "key": 1, "label": "a", "source": "search", "rank": 1 }])
        );
    }

    #[test]
    fn test_transform_passthrough() {
        let out = transform(&map(json!({ "array": [1, 2] }))).unwrap();
        assert_eq!(out, json!({ "results": [1, 2], "resultCount": 2 }));
    }

    // -----------------------------------------------------------------------
    // conditional
    // -----------------------------------------------------------------------

    #[test]
    fn test_conditional_literal_true() {
        let ctx = json!({});
        let decision = conditional(
            &map(json!({ "condition": true, "then": ["a"], "else": ["b"] })),
            &Scope::new(&ctx),
        )
        .unwrap();
        assert_eq!(decision.branch_taken(), "then");
        assert_eq!(
            decision.to_value(),
            json!({
                "conditionResult": true,
                "branchTaken": "then",
                "enabledSteps": ["a"],
                "skippedSteps": ["b"]
            })
        );
    }

    #[test]
    fn test_conditional_expression_against_context() {
        let ctx = json!({ "check": { "output": { "count": 0 } } });
        let decision = conditional(
            &map(json!({ "condition": "check.output.count > 0", "then": ["rerank"] })),
            &Scope::new(&ctx),
        )
        .unwrap();
        assert!(!decision.condition_result);
        assert_eq!(decision.branch_taken(), "else");
        assert!(decision.enabled_steps.is_empty());
        assert_eq!(decision.skipped_steps, vec!["rerank"]);
    }

    #[test]
    fn test_conditional_requires_then_array() {
        let ctx = json!({});
        let err = conditional(&map(json!({ "condition": true, "then": "a" })), &Scope::new(&ctx))
            .unwrap_err();
        assert!(err.to_string().contains("then"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // template
    // -----------------------------------------------------------------------

    #[test]
    fn test_template_text_and_count() {
        let out = template(&map(json!({ "text": "héllo" }))).unwrap();
        assert_eq!(out, json!({ "text": "héllo", "charCount": 5 }));
    }

    #[test]
    fn test_template_renders_non_strings() {
        let out = template(&map(json!({ "text": { "a": 1 } }))).unwrap();
        assert_eq!(out["text"], json!("{\"a\":1}"));
        assert!(template(&Map::new()).is_err());
    }
}
