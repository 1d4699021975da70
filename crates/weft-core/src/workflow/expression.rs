//! Condition evaluator for step `condition`s, `filter` predicates, and
//! conditional branching.
//!
//! A deliberately small language: `||`, `&&`, `!`, parentheses, the
//! comparison operators `=== !== >= <= == != > <`, and operands that are
//! numbers, quoted strings, `true`/`false`/`null`/`undefined`, or dotted
//! paths into the run context (`search.output.results[0].score`).
//!
//! Source text is tokenized, parsed by recursive descent into an [`Expr`]
//! tree, and interpreted with JavaScript comparison and truthiness rules.
//! [`evaluate`] never fails: a parse error or missing path is `false`.

use serde_json::{Map, Number, Value};

use super::references::{is_ident_char, is_ident_start, single_template_body, template_spans};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing an expression.
///
/// Only surfaced by [`Expression::parse`]; [`evaluate`] maps them to `false`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected token {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("empty expression")]
    Empty,
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Variable lookup for evaluation: a borrowed context plus owned bindings.
///
/// Bindings (`item`, `index`, a loop's `as` name) shadow context keys without
/// copying the context.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    base: Option<&'a Map<String, Value>>,
    bindings: Vec<(String, Value)>,
}

impl<'a> Scope<'a> {
    /// Scope over a context value. Non-object contexts resolve nothing.
    pub fn new(context: &'a Value) -> Self {
        Self {
            base: context.as_object(),
            bindings: Vec::new(),
        }
    }

    pub fn from_map(context: &'a Map<String, Value>) -> Self {
        Self {
            base: Some(context),
            bindings: Vec::new(),
        }
    }

    /// Add a binding that shadows any context key of the same name.
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.push((name.into(), value));
        self
    }

    /// Look up a root name, most recent binding first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.base.and_then(|m| m.get(name)))
    }
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Evaluate a condition against a context object. Never fails.
pub fn evaluate(expression: &str, context: &Value) -> bool {
    evaluate_in(expression, &Scope::new(context))
}

/// Evaluate a condition against a scope. Never fails.
///
/// A condition wrapped in a single `{{ ... }}` is unwrapped; text mixing
/// templates and plain text has its delimiters stripped first.
pub fn evaluate_in(expression: &str, scope: &Scope<'_>) -> bool {
    let source = condition_source(expression);
    match Expression::parse(&source) {
        Ok(expr) => expr.evaluate(scope),
        Err(e) => {
            tracing::debug!(expression, error = %e, "condition did not parse, treating as false");
            false
        }
    }
}

fn condition_source(expression: &str) -> String {
    if let Some(body) = single_template_body(expression) {
        return body.to_string();
    }
    if template_spans(expression).is_empty() {
        return expression.trim().to_string();
    }
    expression.replace("{{", "").replace("}}", "").trim().to_string()
}

/// Resolve a dotted path against a scope; `None` is JavaScript `undefined`.
///
/// Each segment may carry one `[n]` index. A trailing `length` segment on an
/// array or string yields its length when no such key exists.
pub fn resolve_path(path: &str, scope: &Scope<'_>) -> Option<Value> {
    let segments = parse_path(path)?;
    let (first, rest) = segments.split_first()?;

    let mut current = scope.get(first.name)?;
    if let Some(i) = first.index {
        current = current.get(i)?;
    }
    for (pos, segment) in rest.iter().enumerate() {
        match current.get(segment.name) {
            Some(next) => current = next,
            None if segment.name == "length" && segment.index.is_none() && pos + 1 == rest.len() => {
                return length_of(current);
            }
            None => return None,
        }
        if let Some(i) = segment.index {
            current = current.get(i)?;
        }
    }
    Some(current.clone())
}

/// JavaScript truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn truthy(value: &Option<Value>) -> bool {
    value.as_ref().is_some_and(is_truthy)
}

struct PathSegment<'p> {
    name: &'p str,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Option<Vec<PathSegment<'_>>> {
    path.split('.')
        .map(|raw| {
            let (name, index) = match raw.find('[') {
                Some(open) => {
                    let inner = raw[open + 1..].strip_suffix(']')?;
                    (&raw[..open], Some(inner.trim().parse::<usize>().ok()?))
                }
                None => (raw, None),
            };
            let mut chars = name.chars();
            let valid = chars.next().is_some_and(is_ident_start) && chars.all(is_ident_char);
            valid.then_some(PathSegment { name, index })
        })
        .collect()
}

fn length_of(value: &Value) -> Option<Value> {
    match value {
        Value::Array(a) => Some(Value::from(a.len())),
        Value::String(s) => Some(Value::from(s.encode_utf16().count())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    StrictEq,
    StrictNe,
    Ge,
    Le,
    Eq,
    Ne,
    Gt,
    Lt,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Path(String),
    Compare(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Operators in longest-first order so `===` never lexes as `==` + `=`.
const OPERATORS: [(&str, Option<CompareOp>); 12] = [
    ("===", Some(CompareOp::StrictEq)),
    ("!==", Some(CompareOp::StrictNe)),
    (">=", Some(CompareOp::Ge)),
    ("<=", Some(CompareOp::Le)),
    ("==", Some(CompareOp::Eq)),
    ("!=", Some(CompareOp::Ne)),
    ("&&", None),
    ("||", None),
    (">", Some(CompareOp::Gt)),
    ("<", Some(CompareOp::Lt)),
    ("!", None),
    ("(", None),
];

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(ExpressionError::UnterminatedString),
                    Some(&q) if q == c => break,
                    Some('\\') => {
                        let escaped = chars.get(i + 1).ok_or(ExpressionError::UnterminatedString)?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&other) => {
                        text.push(other);
                        i += 1;
                    }
                }
            }
            i += 1;
            tokens.push(Token::Str(text));
            continue;
        }

        let starts_number = c.is_ascii_digit()
            || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit));
        if starts_number {
            let begin = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if chars.get(i).copied().is_some_and(is_ident_char) {
                return Err(ExpressionError::UnexpectedChar(chars[i], i));
            }
            let text: String = chars[begin..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ExpressionError::UnexpectedChar(c, begin))?;
            tokens.push(Token::Number(n));
            continue;
        }

        if is_ident_start(c) {
            let begin = i;
            while i < chars.len()
                && (is_ident_char(chars[i]) || matches!(chars[i], '.' | '[' | ']'))
            {
                i += 1;
            }
            tokens.push(Token::Path(chars[begin..i].iter().collect()));
            continue;
        }

        if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        let Some((op, cmp)) = OPERATORS.iter().find(|(op, _)| rest.starts_with(op)) else {
            return Err(ExpressionError::UnexpectedChar(c, i));
        };
        tokens.push(match (*op, cmp) {
            (_, Some(cmp)) => Token::Compare(*cmp),
            ("&&", None) => Token::And,
            ("||", None) => Token::Or,
            ("!", None) => Token::Not,
            _ => Token::LParen,
        });
        i += op.chars().count();
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    /// `None` is `undefined`.
    Literal(Option<Value>),
    Path(String),
}

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Expr,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.operand()?;
        if let Some(Token::Compare(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn operand(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken(format!("{other:?}"))),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(Some(number_value(n)))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Some(Value::String(s)))),
            Some(Token::Path(p)) => Ok(match p.as_str() {
                "true" => Expr::Literal(Some(Value::Bool(true))),
                "false" => Expr::Literal(Some(Value::Bool(false))),
                "null" => Expr::Literal(Some(Value::Null)),
                "undefined" => Expr::Literal(None),
                _ => Expr::Path(p),
            }),
            Some(other) => Err(ExpressionError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

/// Integral literals are kept as JSON integers.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

impl Expression {
    /// Parse a bare expression (no template delimiters).
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.or()?;
        if let Some(extra) = parser.peek() {
            return Err(ExpressionError::UnexpectedToken(format!("{extra:?}")));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Whether the expression uses any operator, as opposed to naming a
    /// single value.
    pub fn has_operator(&self) -> bool {
        !matches!(self.root, Expr::Literal(_) | Expr::Path(_))
    }

    /// Truthiness of the expression's value.
    pub fn evaluate(&self, scope: &Scope<'_>) -> bool {
        truthy(&self.value(scope))
    }

    /// The expression's value. Operators always produce booleans; a bare
    /// operand produces the operand itself.
    pub fn value(&self, scope: &Scope<'_>) -> Option<Value> {
        eval(&self.root, scope)
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, scope: &Scope<'_>) -> Option<Value> {
    let result = match expr {
        Expr::Literal(v) => return v.clone(),
        Expr::Path(p) => return resolve_path(p, scope),
        Expr::Or(l, r) => truthy(&eval(l, scope)) || truthy(&eval(r, scope)),
        Expr::And(l, r) => truthy(&eval(l, scope)) && truthy(&eval(r, scope)),
        Expr::Not(inner) => !truthy(&eval(inner, scope)),
        Expr::Compare(l, op, r) => compare(&eval(l, scope), *op, &eval(r, scope)),
    };
    Some(Value::Bool(result))
}

fn compare(left: &Option<Value>, op: CompareOp, right: &Option<Value>) -> bool {
    match op {
        CompareOp::StrictEq => strict_eq(left, right),
        CompareOp::StrictNe => !strict_eq(left, right),
        CompareOp::Eq => loose_eq(left, right),
        CompareOp::Ne => !loose_eq(left, right),
        CompareOp::Gt => relational(left, right, |o| o.is_gt()),
        CompareOp::Lt => relational(left, right, |o| o.is_lt()),
        CompareOp::Ge => relational(left, right, |o| o.is_ge()),
        CompareOp::Le => relational(left, right, |o| o.is_le()),
    }
}

/// Objects and arrays compare structurally.
fn strict_eq(left: &Option<Value>, right: &Option<Value>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn loose_eq(left: &Option<Value>, right: &Option<Value>) -> bool {
    let nullish = |v: &Option<Value>| matches!(v, None | Some(Value::Null));
    if nullish(left) || nullish(right) {
        return nullish(left) && nullish(right);
    }
    let (Some(a), Some(b)) = (left, right) else {
        return false;
    };
    match (a, b) {
        (Value::Bool(_), _) | (_, Value::Bool(_)) if std::mem::discriminant(a) != std::mem::discriminant(b) => {
            to_number(left) == to_number(right)
        }
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            to_number(left) == to_number(right)
        }
        (Value::Array(_) | Value::Object(_), Value::String(s))
        | (Value::String(s), Value::Array(_) | Value::Object(_)) => {
            let other = if a.is_string() { b } else { a };
            to_primitive_string(other) == *s
        }
        (Value::Array(_) | Value::Object(_), Value::Number(_))
        | (Value::Number(_), Value::Array(_) | Value::Object(_)) => {
            to_number(left) == to_number(right)
        }
        _ => strict_eq(left, right),
    }
}

fn relational(
    left: &Option<Value>,
    right: &Option<Value>,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    if let (Some(Value::String(a)), Some(Value::String(b))) = (left, right) {
        return accept(a.encode_utf16().cmp(b.encode_utf16()));
    }
    let (a, b) = (to_number(left), to_number(right));
    a.partial_cmp(&b).is_some_and(accept)
}

fn to_number(value: &Option<Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => string_to_number(s),
        Some(v @ Value::Array(_)) => string_to_number(&to_primitive_string(v)),
        Some(Value::Object(_)) => f64::NAN,
    }
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

fn to_primitive_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(to_primitive_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
