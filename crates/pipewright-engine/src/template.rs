use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*input((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").unwrap())
}

/// Replace `{{input}}` and `{{input.a.b}}` placeholders with values taken
/// from `input`.
///
/// Strings are inserted verbatim, anything else as compact JSON. A path
/// that hits a missing key or a non-object renders as an empty string.
/// Placeholders that do not start with `input` are left untouched.
pub fn interpolate(template: &str, input: Option<&Value>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            let path = caps.get(1).map_or("", |m| m.as_str());
            match lookup(input, path) {
                Some(value) => stringify(value),
                None => String::new(),
            }
        })
        .into_owned()
}

fn lookup<'a>(input: Option<&'a Value>, path: &str) -> Option<&'a Value> {
    let mut current = input?;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Strings as-is, other values as compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strings as-is, other values as pretty-printed JSON.
pub fn render_pretty(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Whether upstream input carries anything worth forwarding: present,
/// not null and not an empty object.
pub fn has_content(input: Option<&Value>) -> bool {
    match input {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

/// Append the upstream input to a prompt or description as a context block.
pub fn with_context_block(text: &str, input: Option<&Value>) -> String {
    match input {
        Some(value) if has_content(input) => {
            format!(
                "{text}\n\n[Context from previous step]\n{}",
                render_pretty(value)
            )
        }
        _ => text.to_string(),
    }
}
