use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WeftError};

/// Handle a node selects when it has no branch decision to report.
pub const DEFAULT_HANDLE: &str = "source";

/// Node type of the entry node(s).
pub const START_NODE: &str = "start";

/// Cosmetic annotation nodes. Kept in the graph, never dispatched.
pub const NOTE_NODE: &str = "note";

/// A node in a canonical workflow graph.
///
/// `data` is the node's open configuration payload. Each handler parses
/// the fields it needs at dispatch time. `position` is UI layout metadata
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data: empty_object(),
            position: None,
        }
    }

    /// Replace the whole config payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set a single config field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        if !self.data.is_object() {
            self.data = empty_object();
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(key.into(), value);
        }
        self
    }

    /// Display name: `data.title` when present, else the id.
    pub fn title(&self) -> &str {
        self.data
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.id)
    }

    pub fn is_note(&self) -> bool {
        self.node_type == NOTE_NODE
    }

    pub fn is_start(&self) -> bool {
        self.node_type == START_NODE
    }
}

/// A directed edge. `condition` is `None` for unconditional edges,
/// otherwise the canonical handle the source node must select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl GraphEdge {
    /// Create an unconditional edge.
    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    /// Create an edge followed only when the source selects `handle`.
    pub fn when(
        source: impl Into<String>,
        target: impl Into<String>,
        handle: impl AsRef<str>,
    ) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            condition: canonical_condition(handle.as_ref()),
        }
    }

    /// Create an edge followed only when the source node fails.
    pub fn on_error(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::when(source, target, ERROR_HANDLE)
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    pub fn is_error_branch(&self) -> bool {
        self.condition.as_deref() == Some(ERROR_HANDLE)
    }

    /// Whether this conditional edge matches the handle a node selected.
    /// Unconditional edges never match here; callers follow them separately.
    pub fn matches_handle(&self, handle: &str) -> bool {
        match (&self.condition, canonical_condition(handle)) {
            (Some(cond), Some(selected)) => *cond == selected,
            _ => false,
        }
    }
}

/// Handle followed when a node fails.
pub const ERROR_HANDLE: &str = "error";

/// Normalize a handle or condition value to its canonical tag.
///
/// `true`/`if` and `false`/`else` collapse to boolean tags, failure
/// branches collapse to `error`, and the default handle (or an empty
/// value) means "no condition". Anything else is a named branch and is
/// kept verbatim.
pub fn canonical_condition(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "" | DEFAULT_HANDLE => None,
        "true" | "if" => Some("true".to_string()),
        "false" | "else" => Some("false".to_string()),
        "error" | "fail-branch" | "fail_branch" => Some(ERROR_HANDLE.to_string()),
        _ => Some(trimmed.to_string()),
    }
}

/// The canonical graph every workflow executes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl Graph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn start_nodes(&self) -> Vec<&GraphNode> {
        self.nodes.iter().filter(|n| n.is_start()).collect()
    }

    /// Structural checks: unique ids, edges between existing nodes, and at
    /// least one start node. Node types are checked by the executor against
    /// its handler registry.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(WeftError::InvalidDefinition("node with empty id".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(WeftError::InvalidDefinition(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !seen.contains(end.as_str()) {
                    return Err(WeftError::InvalidDefinition(format!(
                        "edge {} -> {} references unknown node {}",
                        edge.source, edge.target, end
                    )));
                }
            }
        }

        if self.start_nodes().is_empty() {
            return Err(WeftError::NoStartNode);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branching_graph() -> Graph {
        Graph::new(
            vec![
                GraphNode::new("start", "start"),
                GraphNode::new("decide", "if_else").with_field("condition", json!(true)),
                GraphNode::new("a", "end"),
                GraphNode::new("b", "end"),
            ],
            vec![
                GraphEdge::always("start", "decide"),
                GraphEdge::when("decide", "a", "if"),
                GraphEdge::when("decide", "b", "else"),
            ],
        )
    }

    #[test]
    fn test_edge_builders_canonicalize() {
        assert_eq!(GraphEdge::when("a", "b", "if").condition.as_deref(), Some("true"));
        assert_eq!(GraphEdge::when("a", "b", "ELSE").condition.as_deref(), Some("false"));
        assert_eq!(GraphEdge::when("a", "b", "source").condition, None);
        assert!(GraphEdge::on_error("a", "b").is_error_branch());
        assert_eq!(
            GraphEdge::when("a", "b", "class_2").condition.as_deref(),
            Some("class_2")
        );
    }

    #[test]
    fn test_matches_handle_aliases() {
        let e = GraphEdge::when("a", "b", "true");
        assert!(e.matches_handle("if"));
        assert!(e.matches_handle("true"));
        assert!(!e.matches_handle("else"));
        assert!(!e.matches_handle("source"));

        let always = GraphEdge::always("a", "b");
        assert!(!always.matches_handle("if"));
    }

    #[test]
    fn test_validate_ok() {
        branching_graph().validate().unwrap();
    }

    #[test]
    fn test_validate_duplicate_id() {
        let mut g = branching_graph();
        g.nodes.push(GraphNode::new("a", "end"));
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node id: a"));
    }

    #[test]
    fn test_validate_dangling_edge() {
        let mut g = branching_graph();
        g.edges.push(GraphEdge::always("a", "ghost"));
        assert!(matches!(g.validate(), Err(WeftError::InvalidDefinition(_))));
    }

    #[test]
    fn test_validate_no_start() {
        let g = Graph::new(vec![GraphNode::new("x", "end")], vec![]);
        assert!(matches!(g.validate(), Err(WeftError::NoStartNode)));
    }

    #[test]
    fn test_json_roundtrip_preserves_graph() {
        let g = branching_graph();
        let back = Graph::from_json(&g.to_json().unwrap()).unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn test_title_falls_back_to_id() {
        let n = GraphNode::new("llm_1", "llm");
        assert_eq!(n.title(), "llm_1");
        let n = n.with_field("title", json!("Summarize"));
        assert_eq!(n.title(), "Summarize");
    }
}
