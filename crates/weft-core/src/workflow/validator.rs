//! Workflow definition validation.
//!
//! Validation runs over the raw structured value rather than the typed
//! definition so that malformed shapes (a step that is not an object, a
//! `then` that is not a list) can be reported instead of failing inside serde.
//!
//! Two reporting modes share one pass:
//! - **strict**: a flat list of error messages; advisory issues are fatal.
//! - **draft**: severity-tagged issues plus counts, for editors that must
//!   tolerate an in-progress definition.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::{Map, Value};
use weft_types::workflow::{
    Severity, StepKind, ValidationIssue, ValidationMode, ValidationReport, ValidationStats,
};

use super::dag::{StepView, branch_members, detect_cycles, graph_from_views};
use super::references::{
    extract_expression_references, extract_references, is_ignored_root, is_iteration_variable,
};

/// Words that cannot be used as step IDs because they collide with
/// reference roots or expression literals.
pub const RESERVED_STEP_IDS: [&str; 9] = [
    "inputs",
    "defaults",
    "item",
    "index",
    "output",
    "true",
    "false",
    "null",
    "undefined",
];

/// Result of [`validate`], shaped by the requested mode.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// Error messages in check order; empty means valid.
    Strict(Vec<String>),
    Draft(ValidationReport),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        match self {
            ValidationOutcome::Strict(errors) => errors.is_empty(),
            ValidationOutcome::Draft(report) => report.valid,
        }
    }
}

/// Validate a workflow definition in the given mode.
pub fn validate(definition: &Value, mode: ValidationMode) -> ValidationOutcome {
    let mut checker = Checker::new(mode);
    checker.run(definition);
    match mode {
        ValidationMode::Strict => {
            ValidationOutcome::Strict(checker.issues.into_iter().map(|i| i.message).collect())
        }
        ValidationMode::Draft => ValidationOutcome::Draft(checker.into_report()),
    }
}

/// Strict validation: every issue is an error message.
pub fn validate_strict(definition: &Value) -> Vec<String> {
    let mut checker = Checker::new(ValidationMode::Strict);
    checker.run(definition);
    checker.issues.into_iter().map(|i| i.message).collect()
}

/// Draft validation: severity-tagged issues with aggregate counts.
pub fn validate_draft(definition: &Value) -> ValidationReport {
    let mut checker = Checker::new(ValidationMode::Draft);
    checker.run(definition);
    checker.into_report()
}

/// `[A-Za-z_][A-Za-z0-9_-]*`
pub fn is_valid_step_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_binding(name: &str) -> bool {
    is_valid_step_id(name) && !name.contains('-')
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

struct Checker {
    mode: ValidationMode,
    issues: Vec<ValidationIssue>,
    total_steps: usize,
}

/// A step that survived the shape checks well enough to take part in
/// reference and graph analysis.
struct RawStep<'a> {
    id: &'a str,
    kind: Option<StepKind>,
    obj: &'a Map<String, Value>,
}

impl<'a> RawStep<'a> {
    fn inputs(&self) -> Option<&'a Map<String, Value>> {
        self.obj.get("inputs").and_then(Value::as_object)
    }

    fn view(&self) -> StepView<'a> {
        StepView {
            id: self.id,
            kind: self.kind,
            inputs: self.inputs(),
            condition: self.obj.get("condition").and_then(Value::as_str),
            for_each: self.obj.get("forEach").and_then(Value::as_str),
        }
    }
}

impl Checker {
    fn new(mode: ValidationMode) -> Self {
        Self {
            mode,
            issues: Vec::new(),
            total_steps: 0,
        }
    }

    fn push(&mut self, severity: Severity, step_id: Option<&str>, code: &str, message: String) -> &mut ValidationIssue {
        self.issues.push(ValidationIssue {
            severity,
            step_id: step_id.map(str::to_string),
            code: code.to_string(),
            message,
            field: None,
            referenced_step: None,
        });
        let last = self.issues.len() - 1;
        &mut self.issues[last]
    }

    /// Structural problem: an error in both modes.
    fn error(&mut self, step_id: Option<&str>, code: &str, message: String) -> &mut ValidationIssue {
        self.push(Severity::Error, step_id, code, message)
    }

    /// Advisory problem: fatal in strict mode, a warning in draft mode.
    fn advisory(&mut self, step_id: Option<&str>, code: &str, message: String) -> &mut ValidationIssue {
        let severity = match self.mode {
            ValidationMode::Strict => Severity::Error,
            ValidationMode::Draft => Severity::Warning,
        };
        self.push(severity, step_id, code, message)
    }

    /// Informational note, only reported in draft mode.
    fn info(&mut self, step_id: Option<&str>, code: &str, message: String) {
        if self.mode == ValidationMode::Draft {
            self.push(Severity::Info, step_id, code, message);
        }
    }

    fn into_report(self) -> ValidationReport {
        let mut stats = ValidationStats {
            total_steps: self.total_steps,
            ..Default::default()
        };
        for issue in &self.issues {
            match issue.severity {
                Severity::Error => stats.errors += 1,
                Severity::Warning => stats.warnings += 1,
                Severity::Info => stats.info += 1,
            }
        }
        ValidationReport {
            valid: stats.errors == 0,
            issues: self.issues,
            stats,
        }
    }

    fn run(&mut self, definition: &Value) {
        // 1. Definition shape
        let Some(root) = definition.as_object() else {
            self.error(
                None,
                "INVALID_DEFINITION",
                "Workflow definition must be an object".to_string(),
            );
            return;
        };
        let Some(steps) = root.get("steps").and_then(Value::as_array) else {
            self.error(
                None,
                "MISSING_STEPS",
                "Workflow definition must have a \"steps\" array".to_string(),
            );
            return;
        };
        self.total_steps = steps.len();

        // 2. Name and top-level sections
        let has_name = root
            .get("name")
            .and_then(Value::as_str)
            .is_some_and(|n| !n.trim().is_empty());
        if !has_name {
            self.advisory(None, "MISSING_NAME", "Workflow is missing a name".to_string())
                .field = Some("name".to_string());
        }
        self.check_top_level(root);

        // 3. Per-step checks
        let mut raw_steps: Vec<RawStep<'_>> = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            if let Some(raw) = self.check_step(index, step) {
                raw_steps.push(raw);
            }
        }

        // 4. Duplicate IDs
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut first_seen: Vec<&str> = Vec::new();
        for raw in &raw_steps {
            let count = counts.entry(raw.id).or_insert(0);
            if *count == 0 {
                first_seen.push(raw.id);
            }
            *count += 1;
        }
        for &id in &first_seen {
            let n = counts[id];
            if n > 1 {
                self.error(
                    Some(id),
                    "DUPLICATE_STEP_ID",
                    format!("Duplicate step id \"{id}\" used by {n} steps"),
                );
            }
        }

        let known_ids: HashSet<&str> = first_seen.iter().copied().collect();

        // 5. Kind-specific structure
        for raw in &raw_steps {
            match raw.kind {
                Some(StepKind::Conditional) => self.check_conditional(raw, &known_ids),
                Some(StepKind::Loop) => self.check_loop(raw),
                _ => {}
            }
        }

        // 6. References
        for raw in &raw_steps {
            self.check_references(raw, &known_ids);
        }

        // 7. Cycles
        let views: Vec<StepView<'_>> = raw_steps.iter().map(RawStep::view).collect();
        let graph = graph_from_views(&views);
        for cycle in detect_cycles(&graph, &first_seen) {
            let first = cycle.first().cloned();
            self.error(
                first.as_deref(),
                "CIRCULAR_DEPENDENCY",
                format!("Circular dependency: {}", cycle.join(" -> ")),
            );
        }

        // 8. Orphans (draft only)
        if self.mode == ValidationMode::Draft && steps.len() > 1 {
            for &id in &first_seen {
                let references_other = graph
                    .get(id)
                    .is_some_and(|deps| deps.iter().any(|d| d != id && known_ids.contains(d.as_str())));
                let referenced_by_other = graph
                    .iter()
                    .any(|(other, deps)| other != id && deps.contains(id));
                if !references_other && !referenced_by_other {
                    self.info(
                        Some(id),
                        "ORPHAN_STEP",
                        format!("Step \"{id}\" neither references nor is referenced by another step"),
                    );
                }
            }
        }
    }

    fn check_top_level(&mut self, root: &Map<String, Value>) {
        if let Some(defaults) = root.get("defaults") {
            if !defaults.is_object() {
                self.error(
                    None,
                    "INVALID_DEFAULTS",
                    "Workflow \"defaults\" must be an object".to_string(),
                )
                .field = Some("defaults".to_string());
            }
        }

        let Some(inputs) = root.get("inputs") else { return };
        let Some(inputs) = inputs.as_object() else {
            self.error(
                None,
                "INVALID_INPUT_SCHEMA",
                "Workflow \"inputs\" must be an object".to_string(),
            )
            .field = Some("inputs".to_string());
            return;
        };
        for (name, schema) in inputs {
            let type_ok = match schema.get("type") {
                None => true,
                Some(Value::String(t)) => matches!(t.as_str(), "string" | "number" | "boolean" | "array"),
                Some(_) => false,
            };
            let required_ok = schema.get("required").is_none_or(Value::is_boolean);
            if !schema.is_object() || !type_ok || !required_ok {
                self.error(
                    None,
                    "INVALID_INPUT_SCHEMA",
                    format!("Input \"{name}\" must declare a type of string, number, boolean, or array"),
                )
                .field = Some(format!("inputs.{name}"));
            }
        }
    }

    fn check_step<'a>(&mut self, index: usize, step: &'a Value) -> Option<RawStep<'a>> {
        let Some(obj) = step.as_object() else {
            self.error(
                None,
                "INVALID_STEP",
                format!("Step at index {index} must be an object"),
            );
            return None;
        };

        let id = match obj.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.as_str()),
            _ => {
                self.error(
                    None,
                    "MISSING_STEP_ID",
                    format!("Step at index {index} is missing an id"),
                )
                .field = Some("id".to_string());
                None
            }
        };
        if let Some(id) = id {
            if !is_valid_step_id(id) {
                self.error(
                    Some(id),
                    "INVALID_STEP_ID",
                    format!(
                        "Step id \"{id}\" must start with a letter or underscore and contain only letters, digits, underscores, or hyphens"
                    ),
                )
                .field = Some("id".to_string());
            } else if RESERVED_STEP_IDS.contains(&id) {
                self.error(
                    Some(id),
                    "RESERVED_STEP_ID",
                    format!("Step id \"{id}\" is a reserved word"),
                )
                .field = Some("id".to_string());
            }
        }
        let label = id.map(|i| format!("Step \"{i}\"")).unwrap_or_else(|| format!("Step at index {index}"));

        let tool_field = if obj.contains_key("tool") { "tool" } else { "kind" };
        let kind = match obj.get(tool_field) {
            Some(Value::String(name)) => match StepKind::from_name(name) {
                Some(kind) => Some(kind),
                None => {
                    self.error(
                        id,
                        "UNKNOWN_TOOL",
                        format!("{label} uses unknown tool \"{name}\""),
                    )
                    .field = Some(tool_field.to_string());
                    None
                }
            },
            _ => {
                self.error(id, "MISSING_TOOL", format!("{label} is missing a tool"))
                    .field = Some("tool".to_string());
                None
            }
        };

        match obj.get("inputs") {
            Some(Value::Object(_)) => {}
            None if kind.is_some_and(StepKind::may_omit_inputs) => {}
            _ => {
                self.error(
                    id,
                    "MISSING_INPUTS",
                    format!("{label} must have an \"inputs\" object"),
                )
                .field = Some("inputs".to_string());
            }
        }

        match obj.get("condition") {
            None | Some(Value::Null) => {}
            Some(Value::String(c)) if c.trim().is_empty() => {
                self.error(id, "EMPTY_CONDITION", format!("{label} has an empty condition"))
                    .field = Some("condition".to_string());
            }
            Some(Value::String(_)) => {}
            Some(_) => {
                self.error(
                    id,
                    "INVALID_CONDITION",
                    format!("{label} condition must be a string"),
                )
                .field = Some("condition".to_string());
            }
        }

        if !matches!(obj.get("forEach"), None | Some(Value::Null) | Some(Value::String(_))) {
            self.error(
                id,
                "INVALID_FOREACH",
                format!("{label} forEach must be a string reference"),
            )
            .field = Some("forEach".to_string());
        }

        if !matches!(obj.get("continueOnError"), None | Some(Value::Bool(_))) {
            self.error(
                id,
                "INVALID_CONTINUE_ON_ERROR",
                format!("{label} continueOnError must be a boolean"),
            )
            .field = Some("continueOnError".to_string());
        }

        match obj.get("name") {
            Some(Value::String(n)) if !n.trim().is_empty() => {}
            None | Some(Value::Null) | Some(Value::String(_)) => {
                self.info(id, "MISSING_STEP_NAME", format!("{label} has no name"));
            }
            Some(_) => {
                self.error(id, "INVALID_STEP_NAME", format!("{label} name must be a string"))
                    .field = Some("name".to_string());
            }
        }

        id.map(|id| RawStep { id, kind, obj })
    }

    fn check_conditional(&mut self, raw: &RawStep<'_>, known_ids: &HashSet<&str>) {
        let id = raw.id;
        let Some(inputs) = raw.inputs() else { return };

        if !matches!(inputs.get("condition"), Some(Value::String(_)) | Some(Value::Bool(_))) {
            self.error(
                Some(id),
                "CONDITIONAL_MISSING_CONDITION",
                format!("Conditional step \"{id}\" requires inputs.condition"),
            )
            .field = Some("inputs.condition".to_string());
        }

        let branch_ok = |v: &Value| v.as_array().is_some_and(|a| a.iter().all(Value::is_string));
        if !inputs.get("then").is_some_and(branch_ok) {
            self.error(
                Some(id),
                "CONDITIONAL_INVALID_THEN",
                format!("Conditional step \"{id}\" requires inputs.then to be an array of step ids"),
            )
            .field = Some("inputs.then".to_string());
        }
        if inputs.get("else").is_some_and(|v| !branch_ok(v)) {
            self.error(
                Some(id),
                "CONDITIONAL_INVALID_ELSE",
                format!("Conditional step \"{id}\" inputs.else must be an array of step ids"),
            )
            .field = Some("inputs.else".to_string());
        }

        for member in branch_members(inputs) {
            if !known_ids.contains(member) {
                let issue = self.advisory(
                    Some(id),
                    "UNKNOWN_BRANCH_STEP",
                    format!("Conditional step \"{id}\" branch references unknown step \"{member}\""),
                );
                issue.referenced_step = Some(member.to_string());
            }
        }
    }

    fn check_loop(&mut self, raw: &RawStep<'_>) {
        let id = raw.id;
        let Some(inputs) = raw.inputs() else { return };

        if matches!(inputs.get("items"), None | Some(Value::Null)) {
            self.error(
                Some(id),
                "LOOP_MISSING_ITEMS",
                format!("Loop step \"{id}\" requires inputs.items"),
            )
            .field = Some("inputs.items".to_string());
        }

        if !inputs.get("as").and_then(Value::as_str).is_some_and(is_valid_binding) {
            self.error(
                Some(id),
                "LOOP_INVALID_AS",
                format!("Loop step \"{id}\" requires inputs.as to be an identifier"),
            )
            .field = Some("inputs.as".to_string());
        }

        match inputs.get("step").and_then(Value::as_object) {
            None => {
                self.error(
                    Some(id),
                    "LOOP_MISSING_STEP",
                    format!("Loop step \"{id}\" requires an inputs.step definition"),
                )
                .field = Some("inputs.step".to_string());
            }
            Some(nested) => {
                let tool = nested
                    .get("tool")
                    .or_else(|| nested.get("kind"))
                    .and_then(Value::as_str);
                if !tool.is_some_and(|t| StepKind::from_name(t).is_some()) {
                    self.error(
                        Some(id),
                        "LOOP_UNKNOWN_TOOL",
                        format!(
                            "Loop step \"{id}\" nested step uses unknown tool \"{}\"",
                            tool.unwrap_or_default()
                        ),
                    )
                    .field = Some("inputs.step.tool".to_string());
                }
            }
        }

        if let Some(max) = inputs.get("maxIterations") {
            if !max.as_u64().is_some_and(|n| n > 0) {
                self.error(
                    Some(id),
                    "LOOP_INVALID_MAX_ITERATIONS",
                    format!("Loop step \"{id}\" maxIterations must be a positive integer"),
                )
                .field = Some("inputs.maxIterations".to_string());
            }
        }
    }

    fn check_references(&mut self, raw: &RawStep<'_>, known_ids: &HashSet<&str>) {
        let id = raw.id;
        let view = raw.view();
        let loop_binding = match raw.kind {
            Some(StepKind::Loop) => view.inputs.and_then(|i| i.get("as")).and_then(Value::as_str),
            _ => None,
        };

        let mut reported: BTreeSet<String> = BTreeSet::new();
        for (field, roots) in field_references(&view) {
            for root in roots {
                let known = is_ignored_root(&root)
                    || is_iteration_variable(&root)
                    || known_ids.contains(root.as_str())
                    || loop_binding == Some(root.as_str());
                if known || !reported.insert(root.clone()) {
                    continue;
                }
                let issue = self.advisory(
                    Some(id),
                    "UNKNOWN_STEP_REF",
                    format!("Step \"{id}\" references unknown step \"{root}\""),
                );
                issue.field = Some(field.clone());
                issue.referenced_step = Some(root);
            }
        }
    }
}

/// References grouped by the field they were found in, in field order.
fn field_references(view: &StepView<'_>) -> Vec<(String, BTreeSet<String>)> {
    let mut out = Vec::new();
    if let Some(inputs) = view.inputs {
        for (key, value) in inputs {
            let mut refs = extract_references(value);
            if key == "condition"
                && matches!(view.kind, Some(StepKind::Conditional | StepKind::Filter))
            {
                if let Value::String(expr) = value {
                    refs.extend(extract_expression_references(expr));
                }
            }
            out.push((format!("inputs.{key}"), refs));
        }
    }
    if let Some(condition) = view.condition {
        out.push(("condition".to_string(), extract_expression_references(condition)));
    }
    if let Some(source) = view.for_each {
        out.push(("forEach".to_string(), extract_expression_references(source)));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
