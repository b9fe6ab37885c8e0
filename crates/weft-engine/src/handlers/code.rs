use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use weft_core::error::Result;
use weft_core::graph::GraphNode;
use weft_core::traits::CodeSandbox;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::handlers::single_output;
use crate::variables::{resolve_bindings, VariableBinding};

/// Runs a code snippet in the configured sandbox. Without a sandbox the
/// node is simulated.
pub struct CodeHandler {
    sandbox: Option<Arc<dyn CodeSandbox>>,
}

impl CodeHandler {
    pub fn new(sandbox: Option<Arc<dyn CodeSandbox>>) -> Self {
        Self { sandbox }
    }
}

#[derive(Deserialize)]
struct CodeConfig {
    #[serde(default)]
    code: String,
    #[serde(default = "default_language")]
    code_language: String,
    #[serde(default)]
    variables: Vec<VariableBinding>,
}

fn default_language() -> String {
    "python3".to_string()
}

impl NodeHandler for CodeHandler {
    fn node_type(&self) -> &str {
        "code"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: CodeConfig = parse_config(node)?;

            let Some(sandbox) = &self.sandbox else {
                debug!(node_id = %node.id, language = %config.code_language, "No sandbox, simulating code node");
                let mut outputs = Map::new();
                outputs.insert("status".to_string(), Value::String("simulated".to_string()));
                outputs.insert("result".to_string(), Value::Null);
                outputs.insert("language".to_string(), Value::String(config.code_language));
                return Ok(NodeExecutionResult::success(outputs));
            };

            let inputs = Value::Object(resolve_bindings(&config.variables, ctx));
            match sandbox.run(&config.code_language, &config.code, inputs).await {
                Ok(Value::Object(map)) => Ok(NodeExecutionResult::success(map)),
                Ok(other) => Ok(NodeExecutionResult::success(single_output("result", other))),
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Sandbox execution failed");
                    Ok(NodeExecutionResult::failure(e.to_string()))
                }
            }
        })
    }
}
