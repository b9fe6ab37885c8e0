use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};

/// Entry node. Publishes declared input variables under its own id so
/// `[start_id, variable]` selectors resolve.
pub struct StartHandler;

#[derive(Deserialize, Default)]
struct StartConfig {
    #[serde(default)]
    variables: Vec<StartVariable>,
}

#[derive(Deserialize)]
struct StartVariable {
    variable: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<Value>,
}

impl NodeHandler for StartHandler {
    fn node_type(&self) -> &str {
        "start"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: StartConfig = parse_config(node)?;
            let mut outputs = Map::new();
            for var in &config.variables {
                let value = ctx
                    .get(&var.variable)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .or_else(|| var.default.clone());
                match value {
                    Some(v) => {
                        outputs.insert(var.variable.clone(), v);
                    }
                    None if var.required => {
                        return Err(WeftError::MissingInput {
                            node: node.id.clone(),
                            input: var.variable.clone(),
                        });
                    }
                    None => {}
                }
            }
            Ok(NodeExecutionResult::success(outputs))
        })
    }
}
