use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{Result, WeftError};
use crate::graph::Graph;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_str(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Unique workflow definition identifier.
    WorkflowId
);
string_id!(
    /// Unique workflow instance (run) identifier.
    InstanceId
);

/// Lifecycle status of a workflow instance.
///
/// An instance is created `Running` and makes exactly one transition to a
/// terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(WeftError::Database(format!("unknown instance status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "ACTIVE" => Ok(Self::Active),
            "ARCHIVED" => Ok(Self::Archived),
            other => Err(WeftError::Database(format!("unknown workflow status: {}", other))),
        }
    }
}

/// A stored workflow: the canonical graph plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default = "default_version")]
    pub version: String,
    pub graph: Graph,
    /// Wall-clock budget per instance. Falls back to the engine default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Node retry policy. Falls back to the engine default.
    #[serde(default)]
    pub retry_policy: Option<RetryConfig>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, graph: Graph) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            description: None,
            status: WorkflowStatus::Active,
            version: default_version(),
            graph,
            timeout_secs: None,
            retry_policy: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryConfig) -> Self {
        self.retry_policy = Some(retry);
        self
    }

    pub fn with_created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = Some(who.into());
        self
    }
}

/// Durable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    pub trace_id: String,
    pub status: InstanceStatus,
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Option<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stack: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    pub trigger_source: String,
}

impl WorkflowInstance {
    /// A fresh RUNNING instance with a new id and trace id.
    pub fn start(
        workflow_id: WorkflowId,
        input_data: Value,
        triggered_by: Option<String>,
        trigger_source: impl Into<String>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            workflow_id,
            trace_id: Uuid::new_v4().to_string(),
            status: InstanceStatus::Running,
            input_data,
            output_data: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
            error_stack: None,
            triggered_by,
            trigger_source: trigger_source.into(),
        }
    }
}

/// The terminal transition applied to a RUNNING instance.
#[derive(Debug, Clone)]
pub struct InstanceCompletion {
    pub status: InstanceStatus,
    pub output_data: Option<Value>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
}

impl InstanceCompletion {
    /// Build a completion stamped now, with the duration measured from
    /// `started_at`. Clock skew never yields a negative duration.
    pub fn finish(
        started_at: DateTime<Utc>,
        status: InstanceStatus,
        output_data: Option<Value>,
    ) -> Self {
        let completed_at = Utc::now().max(started_at);
        Self {
            status,
            output_data,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            error_message: None,
            error_stack: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>, stack: Option<String>) -> Self {
        self.error_message = Some(message.into());
        self.error_stack = stack;
        self
    }
}

/// Status of a per-node trace span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceStatus {
    Running,
    Success,
    Failed,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(WeftError::Database(format!("unknown trace status: {}", other))),
        }
    }
}

/// Parameters for opening a trace span around one node dispatch.
#[derive(Debug, Clone)]
pub struct SpanStart {
    pub trace_id: String,
    pub instance_id: InstanceId,
    pub step_id: String,
    pub step_name: String,
    pub node_type: String,
    pub metadata: Value,
}

/// Opaque handle returned by a trace sink for a started span.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpanHandle(pub String);

/// A recorded node trace row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTrace {
    pub id: String,
    pub trace_id: String,
    pub instance_id: InstanceId,
    pub step_id: String,
    pub step_name: String,
    pub node_type: String,
    pub status: TraceStatus,
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Option<Value>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Option<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

/// One snippet returned by a knowledge-base search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

impl RetrievedChunk {
    pub fn new(content: impl Into<String>, score: f64) -> Self {
        Self {
            content: content.into(),
            score,
            metadata: Value::Null,
        }
    }
}

/// Sampling parameters for a single completion call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Events published on the bus during workflow execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        instance_id: InstanceId,
        workflow_id: WorkflowId,
        trace_id: String,
    },
    NodeStarted {
        instance_id: InstanceId,
        node_id: String,
        node_type: String,
    },
    NodeCompleted {
        instance_id: InstanceId,
        node_id: String,
        node_type: String,
        handle: String,
        success: bool,
        elapsed_ms: u64,
    },
    NodeFailed {
        instance_id: InstanceId,
        node_id: String,
        node_type: String,
        error: String,
    },
    WorkflowCompleted {
        instance_id: InstanceId,
        status: InstanceStatus,
        duration_ms: i64,
    },
    WorkflowFailed {
        instance_id: InstanceId,
        status: InstanceStatus,
        error: String,
    },
}

impl WorkflowEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::WorkflowStarted { instance_id, .. }
            | Self::NodeStarted { instance_id, .. }
            | Self::NodeCompleted { instance_id, .. }
            | Self::NodeFailed { instance_id, .. }
            | Self::WorkflowCompleted { instance_id, .. }
            | Self::WorkflowFailed { instance_id, .. } => instance_id,
        }
    }

    /// Node-level events are only logged at verbosity 2.
    pub fn is_node_event(&self) -> bool {
        matches!(
            self,
            Self::NodeStarted { .. } | Self::NodeCompleted { .. } | Self::NodeFailed { .. }
        )
    }
}
