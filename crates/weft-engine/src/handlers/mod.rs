//! Built-in node handlers, one module per canonical node type.

pub mod aggregator;
pub mod answer;
pub mod assigner;
pub mod code;
pub mod delegate;
pub mod end;
pub mod if_else;
pub mod knowledge;
pub mod llm;
pub mod start;
pub mod template;

/// Wrap a handler body in a one-entry output map.
pub(crate) fn single_output(
    key: &str,
    value: serde_json::Value,
) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), value);
    map
}
