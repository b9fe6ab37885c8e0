use futures::future::BoxFuture;
use serde::Deserialize;

use weft_core::error::Result;
use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::variables::{resolve_bindings, VariableBinding};

/// Terminal node. Its outputs become the instance's output data: either
/// the declared `outputs` bindings or the whole public context.
pub struct EndHandler;

#[derive(Deserialize, Default)]
struct EndConfig {
    #[serde(default)]
    outputs: Vec<VariableBinding>,
}

impl NodeHandler for EndHandler {
    fn node_type(&self) -> &str {
        "end"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: EndConfig = parse_config(node)?;
            let outputs = if config.outputs.is_empty() {
                ctx.snapshot()
            } else {
                resolve_bindings(&config.outputs, ctx)
            };
            Ok(NodeExecutionResult::success(outputs))
        })
    }
}
