use serde_json::Value;

use pipewright_core::error::{PipelineError, Result};
use pipewright_core::traits::ExpressionEvaluator;

/// Built-in expression evaluator.
///
/// Supported expressions, evaluated against a JSON value:
/// - `true` / `false`
/// - `path`: truthiness of the value at `path`; `!path` negates
/// - `path == value`, `path != value`
/// - `path > n`, `path >= n`, `path < n`, `path <= n`: numeric comparison
/// - `path contains "substr"`: substring of a string or member of an array
///
/// Paths are dot-separated and may start with `input`; `input` alone is the
/// whole value. Right-hand sides are JSON literals (`"text"`, `3`, `true`,
/// `null`); bare words are compared as strings.
///
/// Unresolvable paths evaluate as `null`. An empty expression is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleEvaluator;

impl ExpressionEvaluator for SimpleEvaluator {
    fn evaluate(&self, expression: &str, input: &Value) -> Result<bool> {
        evaluate_expression(expression, input)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Contains,
}

// Longest tokens first so `>=` wins over `>`.
const OPERATORS: &[(&str, Operator)] = &[
    (" contains ", Operator::Contains),
    ("==", Operator::Eq),
    ("!=", Operator::Ne),
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    (">", Operator::Gt),
    ("<", Operator::Lt),
];

/// Evaluate `expression` against `input` with the [`SimpleEvaluator`] grammar.
pub fn evaluate_expression(expression: &str, input: &Value) -> Result<bool> {
    let expr = expression.trim();
    if expr.is_empty() {
        return Err(PipelineError::ConfigValidation("empty expression".into()));
    }

    match expr {
        "true" => return Ok(true),
        "false" => return Ok(false),
        _ => {}
    }

    if let Some((lhs, op, rhs)) = split_operator(expr) {
        let left = resolve_path(input, lhs.trim());
        let right = parse_literal(rhs.trim());
        return Ok(compare(&left, op, &right));
    }

    if let Some(path) = expr.strip_prefix('!') {
        return Ok(!is_truthy(&resolve_path(input, path.trim())));
    }

    Ok(is_truthy(&resolve_path(input, expr)))
}

/// Find the first operator outside of a quoted string.
fn split_operator(expr: &str) -> Option<(&str, Operator, &str)> {
    let mut quote: Option<char> = None;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None => {
                let rest = &expr[i..];
                for (token, op) in OPERATORS {
                    if rest.starts_with(token) {
                        return Some((&expr[..i], *op, &rest[token.len()..]));
                    }
                }
            }
        }
    }
    None
}

/// Resolve a dotted path. `input` and `input.` prefixes are optional.
pub fn resolve_path(value: &Value, path: &str) -> Value {
    let path = path.trim();
    let path = match path.strip_prefix("input") {
        Some("") => return value.clone(),
        Some(rest) if rest.starts_with('.') => &rest[1..],
        _ => path,
    };

    let mut current = value;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn parse_literal(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn compare(left: &Value, op: Operator, right: &Value) -> bool {
    match op {
        Operator::Eq => loosely_equal(left, right),
        Operator::Ne => !loosely_equal(left, right),
        Operator::Contains => match (left, right) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), needle) => items.iter().any(|v| loosely_equal(v, needle)),
            _ => false,
        },
        Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            match (as_number(left), as_number(right)) {
                (Some(l), Some(r)) => match op {
                    Operator::Gt => l > r,
                    Operator::Ge => l >= r,
                    Operator::Lt => l < r,
                    _ => l <= r,
                },
                _ => false,
            }
        }
    }
}

/// Numbers compare by value, so `1 == 1.0`; everything else structurally.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) if left.is_number() && right.is_number() => l == r,
        _ => left == right,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
