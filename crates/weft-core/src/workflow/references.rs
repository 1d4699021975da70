//! Reference extraction from step inputs, conditions, and iteration sources.
//!
//! A reference is a dotted path inside a `{{ ... }}` template whose first
//! segment names a step (`{{ search.output.results[0] }}`), the run inputs
//! (`{{ inputs.query }}`), or the workflow defaults. Extraction only reports
//! path roots; callers decide which roots are steps.

use std::collections::BTreeSet;

use serde_json::Value;

/// Roots that refer to run-level data rather than steps.
pub const IGNORED_ROOTS: [&str; 2] = ["inputs", "defaults"];

/// Variables injected per iteration by `forEach`, `filter`, and `loop`.
pub const ITERATION_VARIABLES: [&str; 2] = ["item", "index"];

/// Whether `root` refers to run inputs or defaults.
pub fn is_ignored_root(root: &str) -> bool {
    IGNORED_ROOTS.contains(&root)
}

/// Whether `root` is an injected iteration variable.
pub fn is_iteration_variable(root: &str) -> bool {
    ITERATION_VARIABLES.contains(&root)
}

// ---------------------------------------------------------------------------
// Template spans
// ---------------------------------------------------------------------------

/// A `{{ ... }}` block within a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateSpan<'a> {
    /// Byte offset of the opening `{{`.
    pub start: usize,
    /// Byte offset just past the closing `}}`.
    pub end: usize,
    /// Trimmed text between the delimiters.
    pub body: &'a str,
}

/// Find every complete `{{ ... }}` block in `text`, left to right.
///
/// An unterminated `{{` ends the scan.
pub fn template_spans(text: &str) -> Vec<TemplateSpan<'_>> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(open) = text[cursor..].find("{{") {
        let start = cursor + open;
        let Some(close) = text[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        spans.push(TemplateSpan {
            start,
            end,
            body: text[start + 2..end - 2].trim(),
        });
        cursor = end;
    }
    spans
}

/// If `text` is exactly one template (ignoring surrounding whitespace),
/// return its body.
pub fn single_template_body(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let spans = template_spans(trimmed);
    match spans.as_slice() {
        [only] if only.start == 0 && only.end == trimmed.len() => Some(only.body),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Collect the root of every templated path found anywhere inside `value`.
///
/// Walks arrays and objects recursively; only string leaves can carry
/// references.
pub fn extract_references(value: &Value) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    collect_value(value, &mut refs);
    refs
}

/// Collect path roots from a condition or iteration-source string.
///
/// Templated strings are scanned inside their delimiters only; bare
/// expressions (`check.output.count > 0`) are scanned whole.
pub fn extract_expression_references(expr: &str) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    if expr.contains("{{") {
        for span in template_spans(expr) {
            collect_path_roots(span.body, &mut refs);
        }
    } else {
        collect_path_roots(expr, &mut refs);
    }
    refs
}

fn collect_value(value: &Value, refs: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for span in template_spans(s) {
                collect_path_roots(span.body, refs);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_value(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_value(item, refs);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Scan an expression body for identifiers followed by `.` or `[`.
///
/// Quoted literals are skipped, and identifiers that continue a path
/// (preceded by `.`) are not roots.
fn collect_path_roots(expr: &str, refs: &mut BTreeSet<String>) {
    let chars: Vec<char> = expr.chars().collect();
    let mut prev: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '"' || c == '\'' {
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            prev = Some(c);
            continue;
        }

        let continues_path = prev.is_some_and(|p| p == '.' || is_ident_char(p));
        if is_ident_start(c) && !continues_path {
            let begin = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            if matches!(chars.get(i), Some('.') | Some('[')) {
                refs.insert(chars[begin..i].iter().collect());
            }
            prev = Some(chars[i - 1]);
            continue;
        }

        prev = Some(c);
        i += 1;
    }
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
