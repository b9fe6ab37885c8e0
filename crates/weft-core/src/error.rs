use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Definition errors
    #[error("DSL shape not recognized: {0}")]
    DslShape(String),

    #[error("DSL parse error: {0}")]
    DslParse(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Workflow has no start node")]
    NoStartNode,

    #[error("Unknown node type '{node_type}' on node {node}")]
    UnknownNodeType { node: String, node_type: String },

    #[error("Invalid config for node {node}: {message}")]
    InvalidNodeConfig { node: String, message: String },

    #[error("Missing required input '{input}' for node {node}")]
    MissingInput { node: String, input: String },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("No provider configured for model: {0}")]
    ModelNotFound(String),

    // Collaborator and handler errors
    #[error("{service} call failed: {message}")]
    Collaborator { service: String, message: String },

    #[error("Node execution failed: {node}: {message}")]
    Handler { node: String, message: String },

    #[error("Node timeout after {timeout_secs}s: {node}")]
    NodeTimeout { node: String, timeout_secs: u64 },

    #[error("Workflow exceeded max steps ({0})")]
    StepBudgetExceeded(usize),

    #[error("Workflow exceeded time budget ({0}s)")]
    InstanceTimeout(u64),

    #[error("Workflow cancelled")]
    Cancelled,

    // Lookup errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Errors caused by the workflow definition itself. Never retried.
    pub fn is_definition(&self) -> bool {
        matches!(
            self,
            Self::DslShape(_)
                | Self::DslParse(_)
                | Self::InvalidDefinition(_)
                | Self::NoStartNode
                | Self::UnknownNodeType { .. }
                | Self::InvalidNodeConfig { .. }
                | Self::MissingInput { .. }
        )
    }

    /// Transient runtime failures worth re-invoking a node for.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LlmRequest(_)
                | Self::Collaborator { .. }
                | Self::Handler { .. }
                | Self::NodeTimeout { .. }
                | Self::Io(_)
        )
    }

    /// Short machine-readable code recorded on failed trace spans.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DslShape(_) | Self::DslParse(_) => "DSL_ERROR",
            Self::InvalidDefinition(_) | Self::NoStartNode => "INVALID_DEFINITION",
            Self::UnknownNodeType { .. } => "UNKNOWN_NODE_TYPE",
            Self::InvalidNodeConfig { .. } => "INVALID_NODE_CONFIG",
            Self::MissingInput { .. } => "MISSING_INPUT",
            Self::LlmRequest(_) | Self::LlmParse(_) => "LLM_ERROR",
            Self::UnsupportedProvider(_) | Self::ModelNotFound(_) => "MODEL_UNAVAILABLE",
            Self::Collaborator { .. } => "COLLABORATOR_ERROR",
            Self::Handler { .. } => "NODE_FAILED",
            Self::NodeTimeout { .. } => "NODE_TIMEOUT",
            Self::StepBudgetExceeded(_) => "STEP_BUDGET_EXCEEDED",
            Self::InstanceTimeout(_) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::WorkflowNotFound(_) | Self::InstanceNotFound(_) => "NOT_FOUND",
            Self::Config(_) | Self::ConfigNotFound(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
