use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context key holding the run's trace id.
pub const TRACE_ID_KEY: &str = "__trace_id";
/// Context key holding the run's instance id.
pub const INSTANCE_ID_KEY: &str = "__instance_id";
/// Context key holding the executing workflow's id.
pub const WORKFLOW_ID_KEY: &str = "__workflow_id";

/// Keys with this prefix are engine-internal and never leave the run.
const INTERNAL_PREFIX: &str = "__";

/// Shared mutable state of one workflow run.
///
/// Handlers read their inputs from here and the executor folds every
/// node's outputs back in, both namespaced under the node id and flat
/// under each output key. Writes are last-writer-wins. A run is driven by
/// a single task, so each handler holds the only `&mut` borrow while it
/// executes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    data: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from trigger inputs. A JSON object contributes its
    /// entries; any other non-null value is stored under `input`.
    pub fn from_inputs(inputs: &Value) -> Self {
        let mut ctx = Self::new();
        match inputs {
            Value::Object(map) => {
                for (k, v) in map {
                    ctx.data.insert(k.clone(), v.clone());
                }
            }
            Value::Null => {}
            other => {
                ctx.data.insert("input".to_string(), other.clone());
            }
        }
        ctx
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Fold a node's outputs into the context.
    pub fn merge_outputs(&mut self, node_id: &str, outputs: &Map<String, Value>) {
        for (k, v) in outputs {
            self.data.insert(k.clone(), v.clone());
        }
        self.data
            .insert(node_id.to_string(), Value::Object(outputs.clone()));
    }

    /// The namespaced output map a node produced, if it ran.
    pub fn node_output(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.data.get(node_id).and_then(|v| v.as_object())
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.get_str(TRACE_ID_KEY)
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.get_str(INSTANCE_ID_KEY)
    }

    pub fn is_internal(key: &str) -> bool {
        key.starts_with(INTERNAL_PREFIX)
    }

    /// The context as a JSON object, without internal keys.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.data
            .iter()
            .filter(|(k, _)| !Self::is_internal(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut ctx = ExecutionContext::new();
        ctx.set_str("name", "Alice");
        ctx.set("count", json!(42));

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get("count"), Some(&json!(42)));
        assert_eq!(ctx.get("missing"), None);
        assert_eq!(ctx.remove("name"), Some(json!("Alice")));
        assert!(!ctx.contains_key("name"));
    }

    #[test]
    fn test_from_inputs() {
        let ctx = ExecutionContext::from_inputs(&json!({"query": "rust", "n": 3}));
        assert_eq!(ctx.get_str("query"), Some("rust"));
        assert_eq!(ctx.len(), 2);

        let ctx = ExecutionContext::from_inputs(&json!("just text"));
        assert_eq!(ctx.get_str("input"), Some("just text"));

        assert!(ExecutionContext::from_inputs(&Value::Null).is_empty());
    }

    #[test]
    fn test_merge_outputs_namespaced_and_flat() {
        let mut ctx = ExecutionContext::new();
        ctx.set_str("text", "old");
        let outputs = json!({"text": "new", "model": "m"});
        ctx.merge_outputs("llm_1", outputs.as_object().unwrap());

        assert_eq!(ctx.get_str("text"), Some("new"));
        assert_eq!(ctx.node_output("llm_1").unwrap()["model"], json!("m"));
    }

    #[test]
    fn test_snapshot_hides_internal_keys() {
        let mut ctx = ExecutionContext::new();
        ctx.set_str(TRACE_ID_KEY, "t-1");
        ctx.set_str(INSTANCE_ID_KEY, "i-1");
        ctx.set_str("answer", "42");

        assert_eq!(ctx.trace_id(), Some("t-1"));
        assert_eq!(ctx.instance_id(), Some("i-1"));
        let snap = ctx.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["answer"], json!("42"));
    }
}
