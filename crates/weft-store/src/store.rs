use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use weft_core::error::{Result, WeftError};
use weft_core::graph::Graph;
use weft_core::traits::{InstanceStore, TraceSink, WorkflowStore};
use weft_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL,
        version TEXT NOT NULL,
        workflow_definition TEXT NOT NULL,
        timeout_seconds INTEGER,
        retry_policy TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workflow_instances (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        status TEXT NOT NULL,
        input_data TEXT NOT NULL,
        output_data TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        error_message TEXT,
        error_stack TEXT,
        triggered_by TEXT,
        trigger_source TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_instances_workflow
        ON workflow_instances(workflow_id, started_at);

    CREATE TABLE IF NOT EXISTS workflow_traces (
        id TEXT PRIMARY KEY,
        trace_id TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        step_name TEXT NOT NULL,
        node_type TEXT NOT NULL,
        status TEXT NOT NULL,
        input_data TEXT NOT NULL,
        output_data TEXT,
        error_code TEXT,
        error_message TEXT,
        error_details TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_traces_instance
        ON workflow_traces(instance_id, started_at);";

const INSTANCE_COLUMNS: &str = "id, workflow_id, trace_id, status, input_data, output_data, \
     started_at, completed_at, duration_ms, error_message, error_stack, triggered_by, trigger_source";

const WORKFLOW_COLUMNS: &str = "id, name, description, status, version, workflow_definition, \
     timeout_seconds, retry_policy, created_by, created_at, updated_at";

/// SQLite-backed store for workflows, instances, and node traces.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeftError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| WeftError::Database(e.to_string()))
    }

    /// All trace rows of one instance, in execution order.
    pub fn list_traces(&self, instance_id: &InstanceId) -> Result<Vec<NodeTrace>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, trace_id, instance_id, step_id, step_name, node_type, status,
                        input_data, output_data, error_code, error_message, error_details,
                        started_at, completed_at, duration_ms
                 FROM workflow_traces WHERE instance_id = ?1
                 ORDER BY started_at, rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![instance_id.0], raw_trace)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.into_iter().map(RawTrace::into_trace).collect()
    }

    fn insert_trace(&self, trace: &NodeTrace) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO workflow_traces
                (id, trace_id, instance_id, step_id, step_name, node_type, status,
                 input_data, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trace.id,
                trace.trace_id,
                trace.instance_id.0,
                trace.step_id,
                trace.step_name,
                trace.node_type,
                trace.status.as_str(),
                trace.input_data.to_string(),
                trace.started_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn finish_trace(
        &self,
        id: &str,
        status: TraceStatus,
        outputs: Option<&Value>,
        error: Option<(&str, &str, Option<&Value>)>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let started: Option<String> = conn
            .query_row(
                "SELECT started_at FROM workflow_traces WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(started) = started else {
            return Err(WeftError::Database(format!("trace span not found: {}", id)));
        };

        let started_at = parse_ts(&started)?;
        let completed_at = Utc::now().max(started_at);
        let (code, message, details) = match error {
            Some((c, m, d)) => (Some(c), Some(m), d.map(|v| v.to_string())),
            None => (None, None, None),
        };
        conn.execute(
            "UPDATE workflow_traces
             SET status = ?2, output_data = ?3, error_code = ?4, error_message = ?5,
                 error_details = ?6, completed_at = ?7, duration_ms = ?8
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                outputs.map(|v| v.to_string()),
                code,
                message,
                details,
                completed_at.to_rfc3339(),
                (completed_at - started_at).num_milliseconds(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WeftError::Database(format!("bad timestamp {}: {}", s, e)))
}

fn parse_json(s: &str) -> Result<Value> {
    serde_json::from_str(s).map_err(|e| WeftError::Database(format!("bad JSON column: {}", e)))
}

fn parse_opt_json(s: Option<String>) -> Result<Option<Value>> {
    s.as_deref().map(parse_json).transpose()
}

/// Raw column values, converted to domain types outside the rusqlite
/// row callback so conversion errors keep their own variant.
struct RawInstance {
    id: String,
    workflow_id: String,
    trace_id: String,
    status: String,
    input_data: String,
    output_data: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    error_stack: Option<String>,
    triggered_by: Option<String>,
    trigger_source: String,
}

fn raw_instance(row: &Row<'_>) -> rusqlite::Result<RawInstance> {
    Ok(RawInstance {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        trace_id: row.get(2)?,
        status: row.get(3)?,
        input_data: row.get(4)?,
        output_data: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        duration_ms: row.get(8)?,
        error_message: row.get(9)?,
        error_stack: row.get(10)?,
        triggered_by: row.get(11)?,
        trigger_source: row.get(12)?,
    })
}

impl RawInstance {
    fn into_instance(self) -> Result<WorkflowInstance> {
        Ok(WorkflowInstance {
            id: InstanceId(self.id),
            workflow_id: WorkflowId(self.workflow_id),
            trace_id: self.trace_id,
            status: InstanceStatus::parse(&self.status)?,
            input_data: parse_json(&self.input_data)?,
            output_data: parse_opt_json(self.output_data)?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            duration_ms: self.duration_ms,
            error_message: self.error_message,
            error_stack: self.error_stack,
            triggered_by: self.triggered_by,
            trigger_source: self.trigger_source,
        })
    }
}

struct RawWorkflow {
    id: String,
    name: String,
    description: Option<String>,
    status: String,
    version: String,
    definition: String,
    timeout_seconds: Option<i64>,
    retry_policy: Option<String>,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

fn raw_workflow(row: &Row<'_>) -> rusqlite::Result<RawWorkflow> {
    Ok(RawWorkflow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        version: row.get(4)?,
        definition: row.get(5)?,
        timeout_seconds: row.get(6)?,
        retry_policy: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl RawWorkflow {
    fn into_workflow(self) -> Result<WorkflowDefinition> {
        let graph = Graph::from_json(&self.definition)
            .map_err(|e| WeftError::Database(format!("bad workflow definition: {}", e)))?;
        let retry_policy = self
            .retry_policy
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| WeftError::Database(format!("bad retry policy: {}", e)))?;
        Ok(WorkflowDefinition {
            id: WorkflowId(self.id),
            name: self.name,
            description: self.description,
            status: WorkflowStatus::parse(&self.status)?,
            version: self.version,
            graph,
            timeout_secs: self.timeout_seconds.map(|s| s.max(0) as u64),
            retry_policy,
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawTrace {
    id: String,
    trace_id: String,
    instance_id: String,
    step_id: String,
    step_name: String,
    node_type: String,
    status: String,
    input_data: String,
    output_data: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    error_details: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
}

fn raw_trace(row: &Row<'_>) -> rusqlite::Result<RawTrace> {
    Ok(RawTrace {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        instance_id: row.get(2)?,
        step_id: row.get(3)?,
        step_name: row.get(4)?,
        node_type: row.get(5)?,
        status: row.get(6)?,
        input_data: row.get(7)?,
        output_data: row.get(8)?,
        error_code: row.get(9)?,
        error_message: row.get(10)?,
        error_details: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
        duration_ms: row.get(14)?,
    })
}

impl RawTrace {
    fn into_trace(self) -> Result<NodeTrace> {
        Ok(NodeTrace {
            id: self.id,
            trace_id: self.trace_id,
            instance_id: InstanceId(self.instance_id),
            step_id: self.step_id,
            step_name: self.step_name,
            node_type: self.node_type,
            status: TraceStatus::parse(&self.status)?,
            input_data: parse_json(&self.input_data)?,
            output_data: parse_opt_json(self.output_data)?,
            error_code: self.error_code,
            error_message: self.error_message,
            error_details: parse_opt_json(self.error_details)?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            duration_ms: self.duration_ms,
        })
    }
}

impl WorkflowStore for SqliteStore {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        let workflow = workflow.clone();

        Box::pin(async move {
            let definition = workflow.graph.to_json()?;
            let retry = workflow
                .retry_policy
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflows
                    (id, name, description, status, version, workflow_definition,
                     timeout_seconds, retry_policy, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    status = excluded.status,
                    version = excluded.version,
                    workflow_definition = excluded.workflow_definition,
                    timeout_seconds = excluded.timeout_seconds,
                    retry_policy = excluded.retry_policy,
                    updated_at = excluded.updated_at",
                params![
                    workflow.id.0,
                    workflow.name,
                    workflow.description,
                    workflow.status.as_str(),
                    workflow.version,
                    definition,
                    workflow.timeout_secs.map(|s| s as i64),
                    retry,
                    workflow.created_by,
                    workflow.created_at.to_rfc3339(),
                    workflow.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let raw = {
                let conn = self.lock()?;
                conn.query_row(
                    &format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS),
                    params![id],
                    raw_workflow,
                )
                .optional()
                .map_err(db_err)?
            };
            raw.map(RawWorkflow::into_workflow).transpose()
        })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>> {
        Box::pin(async move {
            let rows = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM workflows ORDER BY created_at DESC",
                        WORKFLOW_COLUMNS
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map([], raw_workflow)
                    .map_err(db_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err)?;
                rows
            };
            rows.into_iter().map(RawWorkflow::into_workflow).collect()
        })
    }
}

impl InstanceStore for SqliteStore {
    fn create_instance(&self, instance: &WorkflowInstance) -> BoxFuture<'_, Result<()>> {
        let inst = instance.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                &format!(
                    "INSERT INTO workflow_instances ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    INSTANCE_COLUMNS
                ),
                params![
                    inst.id.0,
                    inst.workflow_id.0,
                    inst.trace_id,
                    inst.status.as_str(),
                    inst.input_data.to_string(),
                    inst.output_data.as_ref().map(|v| v.to_string()),
                    inst.started_at.to_rfc3339(),
                    inst.completed_at.map(|t| t.to_rfc3339()),
                    inst.duration_ms,
                    inst.error_message,
                    inst.error_stack,
                    inst.triggered_by,
                    inst.trigger_source,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn complete_instance(
        &self,
        id: &InstanceId,
        completion: InstanceCompletion,
    ) -> BoxFuture<'_, Result<bool>> {
        let id = id.0.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            // Single conditional UPDATE: the RUNNING -> terminal transition
            // happens at most once.
            let changed = conn
                .execute(
                    "UPDATE workflow_instances
                     SET status = ?2, output_data = ?3, completed_at = ?4, duration_ms = ?5,
                         error_message = ?6, error_stack = ?7
                     WHERE id = ?1 AND status = 'RUNNING'",
                    params![
                        id,
                        completion.status.as_str(),
                        completion.output_data.as_ref().map(|v| v.to_string()),
                        completion.completed_at.to_rfc3339(),
                        completion.duration_ms,
                        completion.error_message,
                        completion.error_stack,
                    ],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
    }

    fn get_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<WorkflowInstance>>> {
        let id = id.0.clone();

        Box::pin(async move {
            let raw = {
                let conn = self.lock()?;
                conn.query_row(
                    &format!(
                        "SELECT {} FROM workflow_instances WHERE id = ?1",
                        INSTANCE_COLUMNS
                    ),
                    params![id],
                    raw_instance,
                )
                .optional()
                .map_err(db_err)?
            };
            raw.map(RawInstance::into_instance).transpose()
        })
    }

    fn list_instances(
        &self,
        workflow_id: Option<&WorkflowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>> {
        let workflow_id = workflow_id.map(|w| w.0.clone());

        Box::pin(async move {
            let rows = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM workflow_instances
                         WHERE (?1 IS NULL OR workflow_id = ?1)
                         ORDER BY started_at DESC, rowid DESC
                         LIMIT ?2",
                        INSTANCE_COLUMNS
                    ))
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![workflow_id, limit as i64], raw_instance)
                    .map_err(db_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err)?;
                rows
            };
            rows.into_iter().map(RawInstance::into_instance).collect()
        })
    }
}

impl TraceSink for SqliteStore {
    fn start_span(&self, span: SpanStart) -> BoxFuture<'_, Result<SpanHandle>> {
        Box::pin(async move {
            let trace = NodeTrace {
                id: Uuid::new_v4().to_string(),
                trace_id: span.trace_id,
                instance_id: span.instance_id,
                step_id: span.step_id,
                step_name: span.step_name,
                node_type: span.node_type,
                status: TraceStatus::Running,
                input_data: span.metadata,
                output_data: None,
                error_code: None,
                error_message: None,
                error_details: None,
                started_at: Utc::now(),
                completed_at: None,
                duration_ms: None,
            };
            self.insert_trace(&trace)?;
            Ok(SpanHandle(trace.id))
        })
    }

    fn complete_span(&self, handle: &SpanHandle, outputs: Value) -> BoxFuture<'_, Result<()>> {
        let id = handle.0.clone();
        Box::pin(async move { self.finish_trace(&id, TraceStatus::Success, Some(&outputs), None) })
    }

    fn fail_span(
        &self,
        handle: &SpanHandle,
        error_code: &str,
        error_message: &str,
        details: Option<Value>,
    ) -> BoxFuture<'_, Result<()>> {
        let id = handle.0.clone();
        let code = error_code.to_string();
        let message = error_message.to_string();
        Box::pin(async move {
            self.finish_trace(
                &id,
                TraceStatus::Failed,
                None,
                Some((&code, &message, details.as_ref())),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::config::RetryConfig;
    use weft_core::graph::{GraphEdge, GraphNode};

    fn sample_workflow() -> WorkflowDefinition {
        let graph = Graph::new(
            vec![
                GraphNode::new("start", "start"),
                GraphNode::new("end", "end").with_field("title", json!("Done")),
            ],
            vec![GraphEdge::always("start", "end")],
        );
        WorkflowDefinition::new("greeting", graph)
            .with_timeout(30)
            .with_retry_policy(RetryConfig {
                max_retries: 2,
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn test_workflow_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = sample_workflow();
        store.save_workflow(&wf).await.unwrap();

        let loaded = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "greeting");
        assert_eq!(loaded.graph, wf.graph);
        assert_eq!(loaded.timeout_secs, Some(30));
        assert_eq!(loaded.retry_policy, wf.retry_policy);
        assert_eq!(loaded.version, "1.0.0");

        assert_eq!(store.list_workflows().await.unwrap().len(), 1);
        assert!(store.get_workflow(&WorkflowId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_workflow_without_overrides_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowDefinition::new("plain", sample_workflow().graph);
        store.save_workflow(&wf).await.unwrap();

        let loaded = store.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.timeout_secs, None);
        assert_eq!(loaded.retry_policy, None);
    }

    #[tokio::test]
    async fn test_save_workflow_upserts() {
        let store = SqliteStore::in_memory().unwrap();
        let mut wf = sample_workflow();
        store.save_workflow(&wf).await.unwrap();
        wf.name = "renamed".into();
        wf.status = WorkflowStatus::Archived;
        store.save_workflow(&wf).await.unwrap();

        let all = store.list_workflows().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "renamed");
        assert_eq!(all[0].status, WorkflowStatus::Archived);
    }

    #[tokio::test]
    async fn test_instance_terminal_transition_happens_once() {
        let store = SqliteStore::in_memory().unwrap();
        let inst = WorkflowInstance::start(WorkflowId::new(), json!({"q": "hi"}), None, "API");
        store.create_instance(&inst).await.unwrap();

        let done = InstanceCompletion::finish(
            inst.started_at,
            InstanceStatus::Success,
            Some(json!({"answer": 42})),
        );
        assert!(store.complete_instance(&inst.id, done.clone()).await.unwrap());

        let again = InstanceCompletion::finish(inst.started_at, InstanceStatus::Failed, None);
        assert!(!store.complete_instance(&inst.id, again).await.unwrap());

        let loaded = store.get_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Success);
        assert_eq!(loaded.output_data, Some(json!({"answer": 42})));
        assert_eq!(loaded.duration_ms, Some(done.duration_ms));
        assert_eq!(loaded.input_data, json!({"q": "hi"}));
    }

    #[tokio::test]
    async fn test_list_instances_filters_by_workflow() {
        let store = SqliteStore::in_memory().unwrap();
        let wf_a = WorkflowId::new();
        let wf_b = WorkflowId::new();
        for wf in [&wf_a, &wf_a, &wf_b] {
            let inst = WorkflowInstance::start(wf.clone(), json!({}), Some("tester".into()), "CLI");
            store.create_instance(&inst).await.unwrap();
        }
        assert_eq!(store.list_instances(Some(&wf_a), 10).await.unwrap().len(), 2);
        assert_eq!(store.list_instances(Some(&wf_b), 10).await.unwrap().len(), 1);
        assert_eq!(store.list_instances(None, 10).await.unwrap().len(), 3);
        assert_eq!(store.list_instances(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trace_spans() {
        let store = SqliteStore::in_memory().unwrap();
        let instance_id = InstanceId::new();
        let span = |step: &str| SpanStart {
            trace_id: "t-1".into(),
            instance_id: instance_id.clone(),
            step_id: step.into(),
            step_name: step.to_uppercase(),
            node_type: "llm".into(),
            metadata: json!({"model": "deepseek-chat"}),
        };

        let ok = store.start_span(span("a")).await.unwrap();
        store.complete_span(&ok, json!({"text": "hi"})).await.unwrap();
        let bad = store.start_span(span("b")).await.unwrap();
        store
            .fail_span(&bad, "LLM_ERROR", "upstream down", Some(json!({"attempts": 3})))
            .await
            .unwrap();

        let traces = store.list_traces(&instance_id).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].status, TraceStatus::Success);
        assert_eq!(traces[0].output_data, Some(json!({"text": "hi"})));
        assert_eq!(traces[0].step_name, "A");
        assert_eq!(traces[1].status, TraceStatus::Failed);
        assert_eq!(traces[1].error_code.as_deref(), Some("LLM_ERROR"));
        assert_eq!(traces[1].error_details, Some(json!({"attempts": 3})));
        assert!(traces[1].duration_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_finish_unknown_span() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .complete_span(&SpanHandle("missing".into()), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Database(_)));
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weft.db");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
