use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::graph::{GraphNode, DEFAULT_HANDLE};
use weft_core::traits::{AgentInvoker, CodeSandbox, KnowledgeRetriever, ModelRouter, SkillInvoker};

use crate::context::ExecutionContext;
use crate::handlers;

/// What a handler hands back to the executor after running one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeExecutionResult {
    /// Merged into the execution context.
    pub outputs: Map<String, Value>,
    /// Matched against conditional outgoing edges.
    pub selected_handle: String,
    pub success: bool,
}

impl NodeExecutionResult {
    /// A successful result on the default handle.
    pub fn success(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            selected_handle: DEFAULT_HANDLE.to_string(),
            success: true,
        }
    }

    /// A successful result that selects a branch.
    pub fn branch(handle: impl Into<String>, outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            selected_handle: handle.into(),
            success: true,
        }
    }

    /// An anticipated failure. The message is exposed as output `error`.
    pub fn failure(message: impl Into<String>) -> Self {
        let mut outputs = Map::new();
        outputs.insert("error".to_string(), Value::String(message.into()));
        Self {
            outputs,
            selected_handle: DEFAULT_HANDLE.to_string(),
            success: false,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outputs.get("error").and_then(|v| v.as_str())
    }
}

/// Node handler: the behavior behind one canonical node type.
pub trait NodeHandler: Send + Sync + 'static {
    /// Canonical node type this handler serves (e.g., "llm").
    fn node_type(&self) -> &str;

    /// Run one node against the shared context.
    ///
    /// Anticipated failures (an upstream call that failed) should be
    /// returned as [`NodeExecutionResult::failure`]. Errors are reserved
    /// for configuration problems and unexpected faults.
    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>>;
}

/// Parse a node's `data` payload into a handler config struct.
pub fn parse_config<T: DeserializeOwned>(node: &GraphNode) -> Result<T> {
    let data = if node.data.is_null() {
        Value::Object(Map::new())
    } else {
        node.data.clone()
    };
    serde_json::from_value(data).map_err(|e| WeftError::InvalidNodeConfig {
        node: node.id.clone(),
        message: e.to_string(),
    })
}

/// External services handlers may call. Handlers that need a missing
/// collaborator are not registered.
#[derive(Clone)]
pub struct Collaborators {
    pub models: Option<Arc<dyn ModelRouter>>,
    pub knowledge: Option<Arc<dyn KnowledgeRetriever>>,
    pub skills: Option<Arc<dyn SkillInvoker>>,
    pub agents: Option<Arc<dyn AgentInvoker>>,
    pub sandbox: Option<Arc<dyn CodeSandbox>>,
    /// Model used by `llm` nodes when neither node nor context names one.
    pub default_model: String,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            models: None,
            knowledge: None,
            skills: None,
            agents: None,
            sandbox: None,
            default_model: "deepseek-chat".to_string(),
        }
    }
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, models: Arc<dyn ModelRouter>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeRetriever>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillInvoker>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn with_agents(mut self, agents: Arc<dyn AgentInvoker>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

/// Registry of node handlers keyed by canonical node type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Replaces any handler for the same type.
    pub fn register(&mut self, handler: impl NodeHandler) {
        let node_type = handler.node_type().to_string();
        self.handlers.insert(node_type, Arc::new(handler));
    }

    /// Unregister a handler by type.
    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.handlers.remove(node_type).is_some()
    }

    /// Get a handler by node type.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// List registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort();
        types
    }

    /// Resolve the handler for a node or fail with an unknown-type error.
    pub fn resolve(&self, node: &GraphNode) -> Result<Arc<dyn NodeHandler>> {
        self.get(&node.node_type)
            .ok_or_else(|| WeftError::UnknownNodeType {
                node: node.id.clone(),
                node_type: node.node_type.clone(),
            })
    }

    /// Create a registry with the built-in handlers the given
    /// collaborators can support.
    pub fn with_builtins(collaborators: &Collaborators) -> Self {
        let mut registry = Self::new();

        // ── Pure handlers ───────────────────────────────────────
        registry.register(handlers::start::StartHandler);
        registry.register(handlers::end::EndHandler);
        registry.register(handlers::if_else::IfElseHandler);
        registry.register(handlers::template::TemplateTransformHandler);
        registry.register(handlers::aggregator::VariableAggregatorHandler);
        registry.register(handlers::assigner::VariableAssignerHandler);
        registry.register(handlers::answer::AnswerHandler);
        registry.register(handlers::code::CodeHandler::new(collaborators.sandbox.clone()));

        // ── Collaborator-backed handlers ────────────────────────
        if let Some(models) = &collaborators.models {
            registry.register(handlers::llm::LlmHandler::new(
                models.clone(),
                collaborators.default_model.clone(),
            ));
        }
        if let Some(knowledge) = &collaborators.knowledge {
            registry.register(handlers::knowledge::KnowledgeRetrievalHandler::new(
                knowledge.clone(),
            ));
        }
        if let Some(agents) = &collaborators.agents {
            registry.register(handlers::delegate::AgentHandler::new(agents.clone()));
        }
        if let Some(skills) = &collaborators.skills {
            registry.register(handlers::delegate::SkillHandler::new(skills.clone()));
        }

        registry
    }
}
