//! Canned workflow graphs and documents.

use serde_json::json;

use weft_core::graph::{Graph, GraphEdge, GraphNode};

/// `start → check (if/else) → yes | no → end`.
///
/// `check` reads `condition_result` from the context. Each arm writes its
/// own `output` so callers can tell which one ran.
pub fn if_else_graph() -> Graph {
    Graph::new(
        vec![
            GraphNode::new("start", "start"),
            GraphNode::new("check", "if_else"),
            GraphNode::new("yes", "template_transform")
                .with_field("template", json!("took the yes branch")),
            GraphNode::new("no", "template_transform")
                .with_field("template", json!("took the no branch")),
            GraphNode::new("end", "end"),
        ],
        vec![
            GraphEdge::always("start", "check"),
            GraphEdge::when("check", "yes", "true"),
            GraphEdge::when("check", "no", "false"),
            GraphEdge::always("yes", "end"),
            GraphEdge::always("no", "end"),
        ],
    )
}

/// `start → node → end` around a single node of the given type.
pub fn linear_graph(node: GraphNode) -> Graph {
    let id = node.id.clone();
    Graph::new(
        vec![GraphNode::new("start", "start"), node, GraphNode::new("end", "end")],
        vec![GraphEdge::always("start", &id), GraphEdge::always(&id, "end")],
    )
}

/// A Dify workflow export: a start node declaring `query`, an if/else on
/// it, a template arm per branch, an aggregator joining them, and an end
/// node selecting the aggregate. Includes a cosmetic note.
pub const DIFY_EXPORT_YAML: &str = r#"
app:
  name: Triage
  mode: workflow
kind: app
version: 0.1.2
workflow:
  graph:
    nodes:
      - id: "1700000000001"
        type: custom
        position: {x: 30, y: 200}
        data:
          type: start
          title: Start
          variables:
            - variable: query
              label: Query
              type: text-input
              required: true
      - id: "1700000000002"
        type: custom
        data:
          type: if-else
          title: Is urgent
          logical_operator: and
          conditions:
            - variable_selector: ["1700000000001", query]
              comparison_operator: contains
              value: urgent
      - id: "1700000000003"
        type: custom
        data:
          type: template-transform
          title: Escalate
          template: "ESCALATE: {{ q }}"
          variables:
            - variable: q
              value_selector: ["1700000000001", query]
      - id: "1700000000004"
        type: custom
        data:
          type: template-transform
          title: Queue
          template: "queued"
          variables: []
      - id: "1700000000005"
        type: custom
        data:
          type: variable-aggregator
          title: Join
          variables:
            - ["1700000000003", output]
            - ["1700000000004", output]
      - id: "1700000000006"
        type: custom
        data:
          type: end
          title: End
          outputs:
            - variable: result
              value_selector: ["1700000000005", output]
      - id: note-1
        type: custom-note
        data:
          text: "Routes urgent requests"
    edges:
      - id: e1
        source: "1700000000001"
        sourceHandle: source
        target: "1700000000002"
      - id: e2
        source: "1700000000002"
        sourceHandle: "true"
        target: "1700000000003"
      - id: e3
        source: "1700000000002"
        sourceHandle: "false"
        target: "1700000000004"
      - id: e4
        source: "1700000000003"
        sourceHandle: source
        target: "1700000000005"
      - id: e5
        source: "1700000000004"
        sourceHandle: source
        target: "1700000000005"
      - id: e6
        source: "1700000000005"
        sourceHandle: source
        target: "1700000000006"
"#;
