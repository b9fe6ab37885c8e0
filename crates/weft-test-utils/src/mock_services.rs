use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{AgentInvoker, KnowledgeRetriever, SkillInvoker};
use weft_core::types::RetrievedChunk;

#[derive(Default)]
struct RetrieverState {
    chunks: HashMap<String, Vec<RetrievedChunk>>,
    queries: Vec<String>,
    failure: Option<String>,
}

/// In-memory knowledge bases. Returns each base's chunks in insertion
/// order, up to the requested limit.
#[derive(Clone, Default)]
pub struct MockRetriever {
    state: Arc<Mutex<RetrieverState>>,
}

impl MockRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(self, kb_id: impl Into<String>, chunk: RetrievedChunk) -> Self {
        self.state
            .lock()
            .unwrap()
            .chunks
            .entry(kb_id.into())
            .or_default()
            .push(chunk);
        self
    }

    /// Make every search fail with `message`.
    pub fn failing(self, message: impl Into<String>) -> Self {
        self.state.lock().unwrap().failure = Some(message.into());
        self
    }

    /// Queries received, in order.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }
}

impl KnowledgeRetriever for MockRetriever {
    fn search(
        &self,
        knowledge_base_id: &str,
        query: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RetrievedChunk>>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.queries.push(query.to_string());
            match &state.failure {
                Some(message) => Err(WeftError::Collaborator {
                    service: "knowledge".into(),
                    message: message.clone(),
                }),
                None => Ok(state
                    .chunks
                    .get(knowledge_base_id)
                    .map(|c| c.iter().take(limit).cloned().collect())
                    .unwrap_or_default()),
            }
        };
        Box::pin(async move { result })
    }
}

#[derive(Default)]
struct InvokerState {
    results: HashMap<String, Value>,
    calls: Vec<(String, Value)>,
}

impl InvokerState {
    fn invoke(&mut self, service: &str, id: &str, inputs: Value) -> Result<Value> {
        self.calls.push((id.to_string(), inputs));
        self.results
            .get(id)
            .cloned()
            .ok_or_else(|| WeftError::Collaborator {
                service: service.to_string(),
                message: format!("unknown {}: {}", service, id),
            })
    }
}

/// Agent executor with canned results per agent id.
#[derive(Clone, Default)]
pub struct MockAgents {
    state: Arc<Mutex<InvokerState>>,
}

impl MockAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, agent_id: impl Into<String>, result: Value) -> Self {
        self.state.lock().unwrap().results.insert(agent_id.into(), result);
        self
    }

    /// `(agent_id, inputs)` for every invocation.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl AgentInvoker for MockAgents {
    fn invoke(&self, agent_id: &str, inputs: Value) -> BoxFuture<'_, Result<Value>> {
        let result = self.state.lock().unwrap().invoke("agent", agent_id, inputs);
        Box::pin(async move { result })
    }
}

/// Skill executor with canned results per skill id.
#[derive(Clone, Default)]
pub struct MockSkills {
    state: Arc<Mutex<InvokerState>>,
}

impl MockSkills {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(self, skill_id: impl Into<String>, result: Value) -> Self {
        self.state.lock().unwrap().results.insert(skill_id.into(), result);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl SkillInvoker for MockSkills {
    fn invoke(&self, skill_id: &str, inputs: Value) -> BoxFuture<'_, Result<Value>> {
        let result = self.state.lock().unwrap().invoke("skill", skill_id, inputs);
        Box::pin(async move { result })
    }
}
