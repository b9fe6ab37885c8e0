use std::sync::Arc;

use serde_json::json;

use weft_core::config::EngineConfig;
use weft_core::error::WeftError;
use weft_core::graph::Graph;
use weft_core::types::{InstanceStatus, WorkflowDefinition};
use weft_engine::dsl::{self, DocumentFormat};
use weft_engine::{Collaborators, GraphExecutor, HandlerRegistry, WorkflowEngine};
use weft_store::SqliteStore;
use weft_test_utils::{fixtures, write_temp_file};

const START: &str = "1700000000001";
const ESCALATE: &str = "1700000000003";
const QUEUE: &str = "1700000000004";

fn engine(store: Arc<SqliteStore>) -> WorkflowEngine {
    WorkflowEngine::new(
        store.clone(),
        store.clone(),
        HandlerRegistry::with_builtins(&Collaborators::new()),
        EngineConfig::default(),
    )
    .with_trace_sink(store)
}

#[test]
fn test_dify_export_normalizes_to_canonical_graph() {
    let graph = dsl::normalize_str(fixtures::DIFY_EXPORT_YAML, DocumentFormat::Yaml).unwrap();

    assert_eq!(graph.nodes.len(), 7);
    assert_eq!(graph.edges.len(), 6);
    let types: Vec<&str> = graph.nodes.iter().map(|n| n.node_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "start",
            "if_else",
            "template_transform",
            "template_transform",
            "variable_aggregator",
            "end",
            "note"
        ]
    );

    let start: Vec<&str> = graph.start_nodes().iter().map(|n| n.id.as_str()).collect();
    assert_eq!(start, vec![START]);

    let branch: Vec<_> = graph.outgoing("1700000000002").collect();
    assert_eq!(branch.len(), 2);
    assert_eq!(branch[0].condition.as_deref(), Some("true"));
    assert_eq!(branch[1].condition.as_deref(), Some("false"));
    // The default `source` handle is no condition at all
    assert!(graph.outgoing(START).all(|e| e.condition.is_none()));

    let executor = GraphExecutor::new(Arc::new(HandlerRegistry::with_builtins(
        &Collaborators::new(),
    )));
    executor.validate(&graph).unwrap();
}

#[test]
fn test_load_file_detects_format_by_extension() {
    let (_dir, yaml_path) = write_temp_file("triage.yml", fixtures::DIFY_EXPORT_YAML);
    let from_yaml = dsl::load_file(&yaml_path).unwrap();

    let json_text = serde_json::to_string(
        &dsl::parse_document(fixtures::DIFY_EXPORT_YAML, DocumentFormat::Yaml).unwrap(),
    )
    .unwrap();
    let (_dir2, json_path) = write_temp_file("triage.json", &json_text);
    let from_json = dsl::load_file(&json_path).unwrap();

    assert_eq!(from_yaml, from_json);
}

#[test]
fn test_canonical_graph_normalizes_to_itself() {
    let graph = dsl::normalize_str(fixtures::DIFY_EXPORT_YAML, DocumentFormat::Yaml).unwrap();
    let reparsed = dsl::normalize(&serde_json::to_value(&graph).unwrap()).unwrap();
    assert_eq!(graph, reparsed);

    let from_json = Graph::from_json(&graph.to_json().unwrap()).unwrap();
    assert_eq!(graph, from_json);
}

#[test]
fn test_malformed_documents() {
    let err = dsl::normalize_str("workflow: [unclosed", DocumentFormat::Yaml).unwrap_err();
    assert!(matches!(err, WeftError::DslParse(_)));

    let err = dsl::normalize_str("app:\n  name: no graph here\n", DocumentFormat::Yaml).unwrap_err();
    assert!(matches!(err, WeftError::DslShape(_)));

    let err = dsl::normalize(&json!({"nodes": [{"type": "start"}]})).unwrap_err();
    assert!(matches!(err, WeftError::InvalidDefinition(_)));
    assert!(err.is_definition());
}

#[tokio::test]
async fn test_imported_export_routes_on_input() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let engine = engine(store.clone());

    let doc = dsl::parse_document(fixtures::DIFY_EXPORT_YAML, DocumentFormat::Yaml).unwrap();
    let wf = engine.import(&doc, "triage", Some("ops".into())).await.unwrap();
    assert_eq!(wf.created_by.as_deref(), Some("ops"));
    assert_eq!(engine.list_workflows().await.unwrap().len(), 1);

    let urgent = engine
        .trigger(&wf.id, json!({"query": "urgent: printer on fire"}), None, None)
        .await
        .unwrap();
    let inst = engine.get_instance(&urgent).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Success);
    assert_eq!(
        inst.output_data,
        Some(json!({"result": "ESCALATE: urgent: printer on fire"}))
    );

    let routine = engine
        .trigger(&wf.id, json!({"query": "new keyboard please"}), None, None)
        .await
        .unwrap();
    let inst = engine.get_instance(&routine).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Success);
    assert_eq!(inst.output_data, Some(json!({"result": "queued"})));

    // Only the taken arm and never the note leave a trace
    let steps: Vec<String> = store
        .list_traces(&routine)
        .unwrap()
        .into_iter()
        .map(|t| t.step_id)
        .collect();
    assert!(steps.contains(&QUEUE.to_string()));
    assert!(!steps.contains(&ESCALATE.to_string()));
    assert!(!steps.contains(&"note-1".to_string()));
}

#[tokio::test]
async fn test_missing_required_input_fails_instance() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let engine = engine(store);

    let graph = dsl::normalize_str(fixtures::DIFY_EXPORT_YAML, DocumentFormat::Yaml).unwrap();
    let wf = WorkflowDefinition::new("triage", graph);
    engine.save_workflow(&wf).await.unwrap();

    let id = engine.trigger(&wf.id, json!({}), None, None).await.unwrap();
    let inst = engine.get_instance(&id).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Failed);
    assert!(inst.error_stack.unwrap().starts_with("MISSING_INPUT"));
}
