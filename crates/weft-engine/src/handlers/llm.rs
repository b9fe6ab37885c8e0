use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::graph::GraphNode;
use weft_core::traits::ModelRouter;
use weft_core::types::CompletionParams;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::variables::{render_template, resolve_input_str};

/// Sends a rendered prompt to the model the node (or context) names.
pub struct LlmHandler {
    models: Arc<dyn ModelRouter>,
    default_model: String,
}

impl LlmHandler {
    pub fn new(models: Arc<dyn ModelRouter>, default_model: impl Into<String>) -> Self {
        Self {
            models,
            default_model: default_model.into(),
        }
    }
}

#[derive(Deserialize, Default)]
struct LlmConfig {
    #[serde(default)]
    model: Option<ModelRef>,
    #[serde(default)]
    prompt_template: Option<PromptTemplate>,
    #[serde(default)]
    system_prompt: Option<String>,
}

/// `model: "name"` or Dify's `model: {name, completion_params}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelRef {
    Name(String),
    Spec {
        name: String,
        #[serde(default)]
        completion_params: CompletionParamsConfig,
    },
}

#[derive(Deserialize, Default, Clone)]
struct CompletionParamsConfig {
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PromptTemplate {
    Text(String),
    Messages(Vec<PromptMessage>),
}

#[derive(Deserialize)]
struct PromptMessage {
    #[serde(default = "default_role")]
    role: String,
    #[serde(default)]
    text: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Prompt text plus an optional system prompt, both rendered.
fn build_prompt(
    node: &GraphNode,
    config: &LlmConfig,
    ctx: &ExecutionContext,
) -> Result<(String, Option<String>)> {
    let mut system = config
        .system_prompt
        .as_deref()
        .map(|s| render_template(s, ctx));

    let prompt = match &config.prompt_template {
        Some(PromptTemplate::Text(t)) => render_template(t, ctx),
        Some(PromptTemplate::Messages(messages)) => {
            let mut parts = Vec::new();
            for m in messages {
                let text = render_template(&m.text, ctx);
                if m.role == "system" {
                    system = Some(text);
                } else if !text.trim().is_empty() {
                    parts.push(text);
                }
            }
            parts.join("\n\n")
        }
        None => resolve_input_str(node, ctx, "prompt_template")
            .or_else(|| resolve_input_str(node, ctx, "prompt"))
            .map(|t| render_template(&t, ctx))
            .unwrap_or_default(),
    };

    if prompt.trim().is_empty() {
        return Err(WeftError::MissingInput {
            node: node.id.clone(),
            input: "prompt".to_string(),
        });
    }
    Ok((prompt, system))
}

impl NodeHandler for LlmHandler {
    fn node_type(&self) -> &str {
        "llm"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: LlmConfig = parse_config(node)?;

            // Node config, then context, then the engine default
            let (model, sampling) = match &config.model {
                Some(ModelRef::Name(name)) => (name.clone(), CompletionParamsConfig::default()),
                Some(ModelRef::Spec {
                    name,
                    completion_params,
                }) => (name.clone(), completion_params.clone()),
                None => (
                    resolve_input_str(node, ctx, "model")
                        .unwrap_or_else(|| self.default_model.clone()),
                    CompletionParamsConfig::default(),
                ),
            };

            let (prompt, system) = build_prompt(node, &config, ctx)?;
            let params = CompletionParams {
                system,
                max_tokens: sampling.max_tokens,
                temperature: sampling.temperature,
            };

            let provider = match self.models.provider_for(&model) {
                Ok(p) => p,
                Err(e) => {
                    warn!(node_id = %node.id, model = %model, error = %e, "No provider for model");
                    return Ok(NodeExecutionResult::failure(e.to_string()));
                }
            };

            let started = Instant::now();
            match provider.complete(&model, &prompt, &params).await {
                Ok(text) => {
                    info!(
                        node_id = %node.id,
                        model = %model,
                        provider = provider.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "LLM node completed"
                    );
                    let mut outputs = Map::new();
                    outputs.insert("text".to_string(), Value::String(text.clone()));
                    outputs.insert("output".to_string(), Value::String(text));
                    outputs.insert("model".to_string(), Value::String(model));
                    Ok(NodeExecutionResult::success(outputs))
                }
                Err(e) => {
                    warn!(node_id = %node.id, model = %model, error = %e, "LLM call failed");
                    Ok(NodeExecutionResult::failure(e.to_string()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_test_utils::{MockProvider, MockRouter};

    fn handler(router: MockRouter) -> LlmHandler {
        LlmHandler::new(Arc::new(router), "deepseek-chat")
    }

    #[tokio::test]
    async fn test_node_model_overrides_context() {
        let provider = MockProvider::new().with_response("hi there");
        let router = MockRouter::new().with_model("gpt-4o", provider.clone());
        let node = GraphNode::new("llm", "llm")
            .with_data(json!({"model": {"name": "gpt-4o"}, "prompt_template": "Say hi to {{name}}"}));
        let mut ctx = ExecutionContext::from_inputs(&json!({"name": "Ada", "model": "other"}));

        let r = handler(router).execute(&node, &mut ctx).await.unwrap();
        assert!(r.success);
        assert_eq!(r.outputs["text"], json!("hi there"));
        assert_eq!(r.outputs["output"], json!("hi there"));
        assert_eq!(r.outputs["model"], json!("gpt-4o"));

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model, "gpt-4o");
        assert_eq!(calls[0].prompt, "Say hi to Ada");
    }

    #[tokio::test]
    async fn test_context_model_and_prompt() {
        let provider = MockProvider::new().with_response("ok");
        let router = MockRouter::new().with_model("qwen", provider.clone());
        let node = GraphNode::new("llm", "llm");
        let mut ctx =
            ExecutionContext::from_inputs(&json!({"model": "qwen", "prompt": "Summarize {{topic}}", "topic": "Rust"}));

        let r = handler(router).execute(&node, &mut ctx).await.unwrap();
        assert!(r.success);
        assert_eq!(provider.calls()[0].prompt, "Summarize Rust");
    }

    #[tokio::test]
    async fn test_default_model_and_message_list() {
        let provider = MockProvider::new().with_response("ok");
        let router = MockRouter::new().with_model("deepseek-chat", provider.clone());
        let node = GraphNode::new("llm", "llm").with_field(
            "prompt_template",
            json!([
                {"role": "system", "text": "You are terse."},
                {"role": "user", "text": "Q: {{#sys.query#}}"}
            ]),
        );
        let mut ctx = ExecutionContext::from_inputs(&json!({"query": "why?"}));

        handler(router).execute(&node, &mut ctx).await.unwrap();
        let call = &provider.calls()[0];
        assert_eq!(call.model, "deepseek-chat");
        assert_eq!(call.prompt, "Q: why?");
        assert_eq!(call.params.system.as_deref(), Some("You are terse."));
    }

    #[tokio::test]
    async fn test_provider_failure_is_failure_result() {
        let provider = MockProvider::new().with_error("HTTP 503: overloaded");
        let router = MockRouter::new().with_model("deepseek-chat", provider);
        let node = GraphNode::new("llm", "llm").with_field("prompt_template", json!("hello"));
        let mut ctx = ExecutionContext::new();

        let r = handler(router).execute(&node, &mut ctx).await.unwrap();
        assert!(!r.success);
        assert!(r.error_message().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_unknown_model_is_failure_result() {
        let node = GraphNode::new("llm", "llm")
            .with_data(json!({"model": "nope", "prompt_template": "hello"}));
        let mut ctx = ExecutionContext::new();
        let r = handler(MockRouter::new()).execute(&node, &mut ctx).await.unwrap();
        assert!(!r.success);
    }

    #[tokio::test]
    async fn test_missing_prompt_is_definition_error() {
        let router = MockRouter::new().with_model("deepseek-chat", MockProvider::new());
        let node = GraphNode::new("llm", "llm");
        let mut ctx = ExecutionContext::new();
        let err = handler(router).execute(&node, &mut ctx).await.unwrap_err();
        assert!(err.is_definition());
    }
}
