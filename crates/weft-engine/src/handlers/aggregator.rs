use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::handlers::single_output;
use crate::variables::resolve_selector;

/// Picks the first branch output that actually exists. Used after an
/// if/else to join the two arms into one variable.
pub struct VariableAggregatorHandler;

#[derive(Deserialize, Default)]
struct AggregatorConfig {
    #[serde(default)]
    variables: Vec<Vec<String>>,
}

impl NodeHandler for VariableAggregatorHandler {
    fn node_type(&self) -> &str {
        "variable_aggregator"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: AggregatorConfig = parse_config(node)?;
            let value = config
                .variables
                .iter()
                .filter_map(|selector| resolve_selector(ctx, selector))
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null);
            Ok(NodeExecutionResult::success(single_output("output", value)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_non_null_wins() {
        let node = GraphNode::new("agg", "variable_aggregator").with_field(
            "variables",
            json!([["llm_yes", "text"], ["llm_no", "text"]]),
        );
        let mut ctx = ExecutionContext::new();
        ctx.merge_outputs("llm_no", json!({"text": "no branch"}).as_object().unwrap());

        let r = VariableAggregatorHandler.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(r.outputs["output"], json!("no branch"));
    }

    #[tokio::test]
    async fn test_nothing_resolves_to_null() {
        let node = GraphNode::new("agg", "variable_aggregator")
            .with_field("variables", json!([["a", "b"]]));
        let mut ctx = ExecutionContext::new();
        let r = VariableAggregatorHandler.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(r.outputs["output"], Value::Null);
    }
}
