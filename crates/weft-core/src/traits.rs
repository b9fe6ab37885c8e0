use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::*;

/// Completion provider: one upstream model endpoint.
pub trait CompletionProvider: Send + Sync + 'static {
    /// Provider name for logs (e.g., "openai", "deepseek").
    fn name(&self) -> &str;

    /// Send a single-turn prompt and return the response text.
    fn complete(
        &self,
        model: &str,
        prompt: &str,
        params: &CompletionParams,
    ) -> BoxFuture<'_, Result<String>>;
}

/// Model router: resolves a model name to the provider that serves it.
pub trait ModelRouter: Send + Sync + 'static {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn CompletionProvider>>;
}

/// Knowledge retriever: scored snippet search over one knowledge base.
pub trait KnowledgeRetriever: Send + Sync + 'static {
    fn search(
        &self,
        knowledge_base_id: &str,
        query: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RetrievedChunk>>>;
}

/// Skill invoker: runs a registered skill with the workflow context.
pub trait SkillInvoker: Send + Sync + 'static {
    fn invoke(&self, skill_id: &str, inputs: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Agent invoker: runs a configured agent with the workflow context.
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke(&self, agent_id: &str, inputs: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Code sandbox: executes a snippet and returns its output map.
pub trait CodeSandbox: Send + Sync + 'static {
    fn run(&self, language: &str, code: &str, inputs: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Trace sink: per-node begin/end hooks.
pub trait TraceSink: Send + Sync + 'static {
    fn start_span(&self, span: SpanStart) -> BoxFuture<'_, Result<SpanHandle>>;

    fn complete_span(&self, handle: &SpanHandle, outputs: Value) -> BoxFuture<'_, Result<()>>;

    fn fail_span(
        &self,
        handle: &SpanHandle,
        error_code: &str,
        error_message: &str,
        details: Option<Value>,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Workflow store: persistence of workflow definitions.
pub trait WorkflowStore: Send + Sync + 'static {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> BoxFuture<'_, Result<()>>;

    fn get_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>>;
}

/// Instance store: persistence of workflow instance records.
pub trait InstanceStore: Send + Sync + 'static {
    fn create_instance(&self, instance: &WorkflowInstance) -> BoxFuture<'_, Result<()>>;

    /// Apply the terminal transition. Returns `false` if the instance was
    /// no longer RUNNING, in which case nothing is written.
    fn complete_instance(
        &self,
        id: &InstanceId,
        completion: InstanceCompletion,
    ) -> BoxFuture<'_, Result<bool>>;

    fn get_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<WorkflowInstance>>>;

    /// Most recent first. `None` lists instances of every workflow.
    fn list_instances(
        &self,
        workflow_id: Option<&WorkflowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>>;
}
