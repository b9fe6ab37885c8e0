//! Workflow documents to the canonical graph.
//!
//! Accepts Dify exports (YAML or JSON, with the graph nested under
//! `workflow.graph` or `app.workflow.graph`) as well as documents that are
//! already canonical. Normalizing a canonical document is a no-op.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::graph::{canonical_condition, Graph, GraphEdge, GraphNode, NOTE_NODE};

/// Generic container type Dify puts on every node.
const CONTAINER_TYPE: &str = "custom";
const CONTAINER_NOTE_TYPE: &str = "custom-note";

/// External type names that don't map to canonical tags by separator
/// replacement alone, plus the hyphenated Dify names for clarity.
const TYPE_TABLE: &[(&str, &str)] = &[
    ("knowledge-retrieval", "knowledge_retrieval"),
    ("knowledge", "knowledge_retrieval"),
    ("if-else", "if_else"),
    ("condition", "if_else"),
    ("template-transform", "template_transform"),
    ("variable-aggregator", "variable_aggregator"),
    ("variable-assigner", "variable_assigner"),
    ("assigner", "variable_assigner"),
    ("question-classifier", "question_classifier"),
    ("http-request", "http_request"),
    ("parameter-extractor", "parameter_extractor"),
    ("document-extractor", "document_extractor"),
    (CONTAINER_NOTE_TYPE, NOTE_NODE),
];

/// Canonical tag for an external node type.
pub fn canonical_type(raw: &str) -> String {
    let raw = raw.trim();
    TYPE_TABLE
        .iter()
        .find(|(from, _)| *from == raw)
        .map(|(_, to)| to.to_string())
        .unwrap_or_else(|| raw.replace('-', "_"))
}

/// Text encodings a workflow document may arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Pick a format by file extension. Anything that isn't `.json` is
    /// read as YAML, which also accepts JSON.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Parse document text into a JSON value.
pub fn parse_document(text: &str, format: DocumentFormat) -> Result<Value> {
    match format {
        DocumentFormat::Json => {
            serde_json::from_str(text).map_err(|e| WeftError::DslParse(e.to_string()))
        }
        DocumentFormat::Yaml => {
            serde_yaml::from_str(text).map_err(|e| WeftError::DslParse(e.to_string()))
        }
    }
}

/// Parse and normalize document text.
pub fn normalize_str(text: &str, format: DocumentFormat) -> Result<Graph> {
    normalize(&parse_document(text, format)?)
}

/// Read, parse and normalize a document from disk.
pub fn load_file(path: &Path) -> Result<Graph> {
    let text = std::fs::read_to_string(path)?;
    normalize_str(&text, DocumentFormat::from_path(path))
}

/// Normalize a parsed document into the canonical graph.
pub fn normalize(doc: &Value) -> Result<Graph> {
    let container = locate_graph(doc)?;

    let nodes = match container.get("nodes") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, raw)| normalize_node(i, raw))
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(WeftError::InvalidDefinition("`nodes` is not a list".into())),
        None => return Err(WeftError::DslShape("no `nodes` list".into())),
    };

    let edges = match container.get("edges") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, raw)| normalize_edge(i, raw))
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(WeftError::InvalidDefinition("`edges` is not a list".into())),
    };

    debug!(nodes = nodes.len(), edges = edges.len(), "Normalized workflow document");
    Ok(Graph::new(nodes, edges))
}

fn has_nodes(v: &Value) -> bool {
    v.as_object().is_some_and(|m| m.contains_key("nodes"))
}

/// Find the object holding `nodes`/`edges`.
fn locate_graph(doc: &Value) -> Result<&Map<String, Value>> {
    let candidates = [
        doc.get("graph"),
        doc.get("workflow").and_then(|w| w.get("graph")),
        doc.get("app")
            .and_then(|a| a.get("workflow"))
            .and_then(|w| w.get("graph")),
        doc.get("workflow"),
        Some(doc),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|v| has_nodes(v))
        .and_then(|v| v.as_object())
        .ok_or_else(|| {
            let keys = doc
                .as_object()
                .map(|m| m.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_else(|| "not an object".to_string());
            WeftError::DslShape(format!("expected graph, workflow.graph, app.workflow.graph or nodes (found: {})", keys))
        })
}

fn string_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_node(index: usize, raw: &Value) -> Result<GraphNode> {
    if !raw.is_object() {
        return Err(WeftError::InvalidDefinition(format!("node #{} is not an object", index)));
    }
    let id = string_field(raw, "id")
        .ok_or_else(|| WeftError::InvalidDefinition(format!("node #{} has no id", index)))?;

    let data = match raw.get("data") {
        Some(v @ Value::Object(_)) => v.clone(),
        _ => Value::Object(Map::new()),
    };

    let outer = string_field(raw, "type");
    let raw_type = match outer.as_deref() {
        Some(CONTAINER_TYPE) | None => string_field(&data, "type").ok_or_else(|| {
            WeftError::InvalidDefinition(format!("node {} has no type", id))
        })?,
        Some(t) => t.to_string(),
    };

    Ok(GraphNode {
        id,
        node_type: canonical_type(&raw_type),
        data,
        position: raw.get("position").filter(|p| !p.is_null()).cloned(),
    })
}

fn condition_value(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => canonical_condition(s),
        Value::Bool(b) => canonical_condition(if *b { "true" } else { "false" }),
        _ => None,
    }
}

fn normalize_edge(index: usize, raw: &Value) -> Result<GraphEdge> {
    if !raw.is_object() {
        return Err(WeftError::InvalidDefinition(format!("edge #{} is not an object", index)));
    }
    let source = string_field(raw, "source").ok_or_else(|| {
        WeftError::InvalidDefinition(format!("edge #{} has no source", index))
    })?;
    let target = string_field(raw, "target").ok_or_else(|| {
        WeftError::InvalidDefinition(format!("edge #{} has no target", index))
    })?;

    let condition = condition_value(raw.get("condition"))
        .or_else(|| condition_value(raw.get("sourceHandle")))
        .or_else(|| condition_value(raw.get("data").and_then(|d| d.get("condition"))));

    Ok(GraphEdge {
        id: string_field(raw, "id"),
        source,
        target,
        condition,
    })
}
