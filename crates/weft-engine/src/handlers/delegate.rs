//! Nodes that hand the run's context to an agent or a skill.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::graph::GraphNode;
use weft_core::traits::{AgentInvoker, SkillInvoker};

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::handlers::single_output;
use crate::variables::resolve_value;

/// Agent and skill ids may be given as numbers or strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRef {
    Text(String),
    Number(i64),
}

impl IdRef {
    fn into_string(self) -> String {
        match self {
            IdRef::Text(s) => s.trim().to_string(),
            IdRef::Number(n) => n.to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
struct AgentConfig {
    #[serde(default, alias = "agent_id", rename = "agentId")]
    agent_id: Option<IdRef>,
    #[serde(default)]
    inputs: Map<String, Value>,
}

#[derive(Deserialize, Default)]
struct SkillConfig {
    #[serde(default, alias = "skill_id", rename = "skillId")]
    skill_id: Option<IdRef>,
    #[serde(default)]
    inputs: Map<String, Value>,
}

/// The context snapshot overlaid with the node's resolved `inputs`.
fn build_inputs(extra: &Map<String, Value>, ctx: &ExecutionContext) -> Value {
    let mut inputs = ctx.snapshot();
    for (k, v) in extra {
        inputs.insert(k.clone(), resolve_value(v, ctx));
    }
    Value::Object(inputs)
}

fn into_outputs(result: Value) -> Map<String, Value> {
    match result {
        Value::Object(map) => map,
        other => single_output("output", other),
    }
}

fn required_id(node: &GraphNode, id: Option<IdRef>, field: &str) -> Result<String> {
    id.map(IdRef::into_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WeftError::InvalidNodeConfig {
            node: node.id.clone(),
            message: format!("missing `{}`", field),
        })
}

/// Runs a configured agent.
pub struct AgentHandler {
    agents: Arc<dyn AgentInvoker>,
}

impl AgentHandler {
    pub fn new(agents: Arc<dyn AgentInvoker>) -> Self {
        Self { agents }
    }
}

impl NodeHandler for AgentHandler {
    fn node_type(&self) -> &str {
        "agent"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: AgentConfig = parse_config(node)?;
            let agent_id = required_id(node, config.agent_id, "agentId")?;
            let inputs = build_inputs(&config.inputs, ctx);

            match self.agents.invoke(&agent_id, inputs).await {
                Ok(result) => {
                    info!(node_id = %node.id, agent_id = %agent_id, "Agent node completed");
                    Ok(NodeExecutionResult::success(into_outputs(result)))
                }
                Err(e) => {
                    warn!(node_id = %node.id, agent_id = %agent_id, error = %e, "Agent invocation failed");
                    Ok(NodeExecutionResult::failure(e.to_string()))
                }
            }
        })
    }
}

/// Runs a registered skill.
pub struct SkillHandler {
    skills: Arc<dyn SkillInvoker>,
}

impl SkillHandler {
    pub fn new(skills: Arc<dyn SkillInvoker>) -> Self {
        Self { skills }
    }
}

impl NodeHandler for SkillHandler {
    fn node_type(&self) -> &str {
        "skill"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: SkillConfig = parse_config(node)?;
            let skill_id = required_id(node, config.skill_id, "skillId")?;
            let inputs = build_inputs(&config.inputs, ctx);

            match self.skills.invoke(&skill_id, inputs).await {
                Ok(result) => {
                    info!(node_id = %node.id, skill_id = %skill_id, "Skill node completed");
                    Ok(NodeExecutionResult::success(into_outputs(result)))
                }
                Err(e) => {
                    warn!(node_id = %node.id, skill_id = %skill_id, error = %e, "Skill invocation failed");
                    Ok(NodeExecutionResult::failure(e.to_string()))
                }
            }
        })
    }
}
