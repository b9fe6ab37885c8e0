use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::handlers::single_output;
use crate::variables::render_template;

/// Chatflow answer node.
pub struct AnswerHandler;

#[derive(Deserialize, Default)]
struct AnswerConfig {
    #[serde(default)]
    answer: String,
}

impl NodeHandler for AnswerHandler {
    fn node_type(&self) -> &str {
        "answer"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: AnswerConfig = parse_config(node)?;
            let answer = render_template(&config.answer, ctx);
            Ok(NodeExecutionResult::success(single_output(
                "answer",
                Value::String(answer),
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_renders_dify_reference() {
        let node = GraphNode::new("ans", "answer").with_field("answer", json!("{{#llm.text#}}!"));
        let mut ctx = ExecutionContext::new();
        ctx.merge_outputs("llm", json!({"text": "42"}).as_object().unwrap());
        let r = AnswerHandler.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(r.outputs["answer"], json!("42!"));
    }
}
