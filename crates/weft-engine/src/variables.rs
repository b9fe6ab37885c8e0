//! Variable references inside node configuration.
//!
//! Two syntaxes are understood:
//! - value selectors, `["node_id", "key", ...]`, as used by Dify exports;
//!   the pseudo-node `sys` selects from the flat context;
//! - templates, `{{#node_id.key#}}` (Dify) and `{{ name }}` /
//!   `{{ node_id.key }}`.
//!
//! Unresolved references render as empty strings.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;

const SYS_NAMESPACE: &str = "sys";

const TEMPLATE_PATTERN: &str =
    r"\{\{#\s*([^#{}]+?)\s*#\}\}|\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}";

/// `None` only if the pattern fails to compile; templates then stay literal.
fn template_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(TEMPLATE_PATTERN) {
        Ok(re) => Some(re),
        Err(e) => {
            error!(error = %e, "Template pattern failed to compile");
            None
        }
    })
    .as_ref()
}

/// A `{variable, value_selector}` binding as found in Dify node configs.
#[derive(Debug, Clone, Deserialize)]
pub struct VariableBinding {
    pub variable: String,
    #[serde(default)]
    pub value_selector: Vec<String>,
}

/// Resolve a value selector against the context.
pub fn resolve_selector(ctx: &ExecutionContext, selector: &[String]) -> Option<Value> {
    let (head, rest) = selector.split_first()?;
    if head == SYS_NAMESPACE {
        let (key, path) = rest.split_first()?;
        return walk(ctx.get(key)?, path);
    }
    if let Some(outputs) = ctx.node_output(head) {
        if let Some((key, path)) = rest.split_first() {
            if let Some(v) = outputs.get(key) {
                return walk(v, path);
            }
        }
    }
    walk(ctx.get(head)?, rest)
}

/// Resolve a dotted reference such as `query`, `sys.query`, or
/// `llm_1.text`.
pub fn resolve_path(ctx: &ExecutionContext, path: &str) -> Option<Value> {
    let segments: Vec<String> = path
        .split('.')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    resolve_selector(ctx, &segments)
}

fn walk(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Text form of a value for prompt and template rendering.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn capture_path<'h>(caps: &Captures<'h>) -> &'h str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str())
        .unwrap_or_default()
}

/// Render a template against the context.
pub fn render_template(template: &str, ctx: &ExecutionContext) -> String {
    render_template_with(template, &|path| resolve_path(ctx, path))
}

/// Render a template with a custom reference resolver.
pub fn render_template_with(template: &str, resolve: &dyn Fn(&str) -> Option<Value>) -> String {
    let Some(re) = template_regex() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| {
        resolve(capture_path(caps))
            .map(|v| value_to_text(&v))
            .unwrap_or_default()
    })
    .into_owned()
}

/// If `text` is exactly one reference, return the referenced path.
pub fn single_reference(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let caps = template_regex()?.captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        Some(capture_path(&caps))
    } else {
        None
    }
}

pub fn has_reference(text: &str) -> bool {
    template_regex().is_some_and(|re| re.is_match(text))
}

/// Resolve a config value that may carry references.
///
/// A string that is a single reference yields the referenced value with
/// its JSON type intact. A string with embedded references renders to a
/// string. Everything else is returned as-is.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) if has_reference(s) => match single_reference(s) {
            Some(path) => resolve_path(ctx, path).unwrap_or(Value::Null),
            None => Value::String(render_template(s, ctx)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Look up a named input for a node.
///
/// An entry in the node's `inputMapping` (or `input_mapping`) takes
/// precedence over the context key of the same name.
pub fn resolve_input(node: &GraphNode, ctx: &ExecutionContext, name: &str) -> Option<Value> {
    let mapping = node
        .data
        .get("inputMapping")
        .or_else(|| node.data.get("input_mapping"))
        .and_then(|m| m.as_object());
    if let Some(mapped) = mapping.and_then(|m| m.get(name)) {
        let v = resolve_value(mapped, ctx);
        if !v.is_null() {
            return Some(v);
        }
    }
    ctx.get(name).cloned()
}

/// String form of [`resolve_input`], treating empty strings as absent.
pub fn resolve_input_str(node: &GraphNode, ctx: &ExecutionContext, name: &str) -> Option<String> {
    resolve_input(node, ctx, name)
        .map(|v| value_to_text(&v))
        .filter(|s| !s.trim().is_empty())
}

/// Resolve a list of bindings to `(variable, value)` pairs.
pub fn resolve_bindings(
    bindings: &[VariableBinding],
    ctx: &ExecutionContext,
) -> serde_json::Map<String, Value> {
    bindings
        .iter()
        .map(|b| {
            (
                b.variable.clone(),
                resolve_selector(ctx, &b.value_selector).unwrap_or(Value::Null),
            )
        })
        .collect()
}
