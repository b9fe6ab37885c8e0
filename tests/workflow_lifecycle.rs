use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map};

use weft_core::config::EngineConfig;
use weft_core::error::Result;
use weft_core::graph::{Graph, GraphEdge, GraphNode};
use weft_core::types::{
    InstanceId, InstanceStatus, TraceStatus, WorkflowDefinition, WorkflowEvent, WorkflowInstance,
};
use weft_engine::{
    Collaborators, ExecutionContext, HandlerRegistry, NodeExecutionResult, NodeHandler,
    WorkflowEngine,
};
use weft_store::SqliteStore;
use weft_test_utils::fixtures;

struct Failing;

impl NodeHandler for Failing {
    fn node_type(&self) -> &str {
        "failing"
    }

    fn execute<'a>(
        &'a self,
        _node: &'a GraphNode,
        _ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async { Ok(NodeExecutionResult::failure("upstream unavailable")) })
    }
}

struct Panicking;

impl NodeHandler for Panicking {
    fn node_type(&self) -> &str {
        "panicking"
    }

    fn execute<'a>(
        &'a self,
        _node: &'a GraphNode,
        _ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async { panic!("boom") })
    }
}

struct Sleepy(Duration);

impl NodeHandler for Sleepy {
    fn node_type(&self) -> &str {
        "sleepy"
    }

    fn execute<'a>(
        &'a self,
        _node: &'a GraphNode,
        _ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        let delay = self.0;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(NodeExecutionResult::success(Map::new()))
        })
    }
}

fn setup(sleep: Duration) -> (Arc<SqliteStore>, Arc<WorkflowEngine>) {
    let store = Arc::new(SqliteStore::in_memory().expect("open store"));
    let mut registry = HandlerRegistry::with_builtins(&Collaborators::new());
    registry.register(Failing);
    registry.register(Panicking);
    registry.register(Sleepy(sleep));
    let engine = WorkflowEngine::new(store.clone(), store.clone(), registry, EngineConfig::default())
        .with_trace_sink(store.clone());
    (store, Arc::new(engine))
}

async fn saved(engine: &WorkflowEngine, name: &str, graph: Graph) -> WorkflowDefinition {
    let wf = WorkflowDefinition::new(name, graph);
    engine.save_workflow(&wf).await.expect("save workflow");
    wf
}

async fn run(engine: &WorkflowEngine, wf: &WorkflowDefinition, inputs: serde_json::Value) -> WorkflowInstance {
    let id = engine.trigger(&wf.id, inputs, None, None).await.expect("trigger");
    engine.get_instance(&id).await.expect("instance")
}

async fn wait_for_terminal(
    rx: &mut tokio::sync::broadcast::Receiver<WorkflowEvent>,
    id: &InstanceId,
) {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(WorkflowEvent::WorkflowCompleted { instance_id, .. })
                | Ok(WorkflowEvent::WorkflowFailed { instance_id, .. })
                    if &instance_id == id =>
                {
                    return
                }
                Ok(_) => {}
                Err(e) => panic!("event bus error: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("instance should finish");
}

#[tokio::test]
async fn test_branch_selection_end_to_end() {
    let (store, engine) = setup(Duration::ZERO);
    let wf = saved(&engine, "branch", fixtures::if_else_graph()).await;

    let yes = run(&engine, &wf, json!({"condition_result": true})).await;
    assert_eq!(yes.status, InstanceStatus::Success);
    assert_eq!(yes.output_data.as_ref().unwrap()["output"], json!("took the yes branch"));

    let no = run(&engine, &wf, json!({"condition_result": false})).await;
    assert_eq!(no.status, InstanceStatus::Success);
    assert_eq!(no.output_data.as_ref().unwrap()["output"], json!("took the no branch"));

    let steps: Vec<String> = store
        .list_traces(&no.id)
        .unwrap()
        .into_iter()
        .map(|t| t.step_id)
        .collect();
    assert_eq!(steps, vec!["start", "check", "no", "end"]);

    let all = engine.list_instances(Some(&wf.id), 10).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_terminal_instance_has_timing() {
    let (_store, engine) = setup(Duration::from_millis(20));
    let wf = saved(&engine, "slow", fixtures::linear_graph(GraphNode::new("nap", "sleepy"))).await;

    let inst = run(&engine, &wf, json!({})).await;
    assert_eq!(inst.status, InstanceStatus::Success);
    let completed = inst.completed_at.expect("completed_at set");
    assert!(completed >= inst.started_at);
    assert!(inst.duration_ms.expect("duration set") >= 20);
    assert!(inst.error_message.is_none());
}

#[tokio::test]
async fn test_failure_result_fails_instance() {
    let (store, engine) = setup(Duration::ZERO);
    let wf = saved(&engine, "fails", fixtures::linear_graph(GraphNode::new("call", "failing"))).await;

    let inst = run(&engine, &wf, json!({"seed": 1})).await;
    assert_eq!(inst.status, InstanceStatus::Failed);
    assert_eq!(
        inst.error_message.as_deref(),
        Some("Node call failed: upstream unavailable")
    );
    assert!(inst.error_stack.unwrap().starts_with("NODE_FAILED"));
    // Partial context is kept
    assert_eq!(inst.output_data.unwrap()["seed"], json!(1));

    let traces = store.list_traces(&inst.id).unwrap();
    let call = traces.iter().find(|t| t.step_id == "call").unwrap();
    assert_eq!(call.status, TraceStatus::Failed);
    assert_eq!(call.error_code.as_deref(), Some("NODE_FAILED"));
    assert!(!traces.iter().any(|t| t.step_id == "end"));
}

#[tokio::test]
async fn test_error_edge_recovers() {
    let (_store, engine) = setup(Duration::ZERO);
    let graph = Graph::new(
        vec![
            GraphNode::new("start", "start"),
            GraphNode::new("call", "failing"),
            GraphNode::new("fallback", "template_transform")
                .with_field("template", json!("fallback: {{ error }}")),
            GraphNode::new("end", "end"),
        ],
        vec![
            GraphEdge::always("start", "call"),
            GraphEdge::always("call", "end"),
            GraphEdge::on_error("call", "fallback"),
            GraphEdge::always("fallback", "end"),
        ],
    );
    let wf = saved(&engine, "recovers", graph).await;

    let inst = run(&engine, &wf, json!({})).await;
    assert_eq!(inst.status, InstanceStatus::Success);
    assert_eq!(
        inst.output_data.unwrap()["output"],
        json!("fallback: upstream unavailable")
    );
}

#[tokio::test]
async fn test_panicking_handler_fails_instance() {
    let (_store, engine) = setup(Duration::ZERO);
    let wf = saved(&engine, "panics", fixtures::linear_graph(GraphNode::new("bad", "panicking"))).await;

    let inst = run(&engine, &wf, json!({})).await;
    assert_eq!(inst.status, InstanceStatus::Failed);
    assert!(inst.error_message.unwrap().contains("boom"));
    assert!(inst.error_stack.unwrap().starts_with("PANIC"));
    assert!(inst.completed_at.is_some());
}

#[tokio::test]
async fn test_stored_graph_runs_like_the_original() {
    let (_store, engine) = setup(Duration::ZERO);
    let wf = saved(&engine, "branch", fixtures::if_else_graph()).await;

    let stored = engine.get_workflow(&wf.id).await.unwrap();
    assert_eq!(stored.graph, fixtures::if_else_graph());

    let copy = saved(&engine, "copy", Graph::from_json(&stored.graph.to_json().unwrap()).unwrap()).await;
    let a = run(&engine, &wf, json!({"condition_result": false})).await;
    let b = run(&engine, &copy, json!({"condition_result": false})).await;
    assert_eq!(a.status, b.status);
    assert_eq!(a.output_data, b.output_data);
}

#[tokio::test]
async fn test_cycle_terminates() {
    let (store, engine) = setup(Duration::ZERO);
    let graph = Graph::new(
        vec![
            GraphNode::new("start", "start"),
            GraphNode::new("a", "template_transform").with_field("template", json!("a")),
            GraphNode::new("b", "template_transform").with_field("template", json!("b")),
        ],
        vec![
            GraphEdge::always("start", "a"),
            GraphEdge::always("a", "b"),
            GraphEdge::always("b", "a"),
        ],
    );
    let wf = saved(&engine, "loop", graph).await;

    let inst = run(&engine, &wf, json!({})).await;
    assert_eq!(inst.status, InstanceStatus::Success);
    assert_eq!(store.list_traces(&inst.id).unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancel_spawned_instance() {
    let (_store, engine) = setup(Duration::from_millis(300));
    let wf = saved(&engine, "slow", fixtures::linear_graph(GraphNode::new("nap", "sleepy"))).await;

    let mut rx = engine.events().subscribe();
    let id = engine
        .spawn(&wf.id, json!({}), Some("tester".into()), Some("test".into()))
        .await
        .unwrap();

    // Visible as RUNNING right away
    let inst = engine.get_instance(&id).await.unwrap();
    assert!(!inst.status.is_terminal());
    assert_eq!(inst.trigger_source, "test");

    loop {
        match rx.recv().await.unwrap() {
            WorkflowEvent::NodeStarted { node_type, .. } if node_type == "sleepy" => break,
            _ => {}
        }
    }
    assert!(engine.cancel(&id).await.unwrap());
    wait_for_terminal(&mut rx, &id).await;

    let inst = engine.get_instance(&id).await.unwrap();
    assert_eq!(inst.status, InstanceStatus::Cancelled);
    assert!(!engine.cancel(&id).await.unwrap());
}

#[tokio::test]
async fn test_workflow_timeout() {
    let (_store, engine) = setup(Duration::from_secs(5));
    let wf = WorkflowDefinition::new("slow", fixtures::linear_graph(GraphNode::new("nap", "sleepy")))
        .with_timeout(1);
    engine.save_workflow(&wf).await.unwrap();

    let inst = run(&engine, &wf, json!({})).await;
    assert_eq!(inst.status, InstanceStatus::Timeout);
    assert!(inst.duration_ms.unwrap() < 5_000);
}

#[tokio::test]
async fn test_node_traces_recorded() {
    let (store, engine) = setup(Duration::ZERO);
    let wf = saved(&engine, "branch", fixtures::if_else_graph()).await;

    let inst = run(&engine, &wf, json!({"condition_result": true})).await;
    let traces = store.list_traces(&inst.id).unwrap();
    assert_eq!(traces.len(), 4);
    for t in &traces {
        assert_eq!(t.status, TraceStatus::Success);
        assert_eq!(t.trace_id, inst.trace_id);
        assert!(t.completed_at.is_some());
    }
    let yes = traces.iter().find(|t| t.step_id == "yes").unwrap();
    assert_eq!(yes.node_type, "template_transform");
    assert_eq!(yes.input_data["type"], json!("template_transform"));
    assert_eq!(
        yes.output_data.as_ref().unwrap()["output"],
        json!("took the yes branch")
    );
}
