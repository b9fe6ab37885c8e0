use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use weft_core::config::ModelConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::CompletionProvider;
use weft_core::types::CompletionParams;

use crate::presets::ProviderPreset;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible completion client. Works with OpenAI, DeepSeek, Ollama,
/// vLLM, Groq, OpenRouter, etc.
pub struct OpenAiProvider {
    http: Client,
    name: String,
    base_url: String,
    api_key: Option<String>,
    model_id: Option<String>,
    max_tokens: u32,
    temperature: f32,
    extra_headers: Vec<(String, String)>,
}

impl OpenAiProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            model_id: None,
            max_tokens: 4096,
            temperature: 0.7,
            extra_headers: vec![],
        }
    }

    pub fn from_config(config: &ModelConfig, preset: Option<&ProviderPreset>) -> Self {
        let base_url = config
            .base_url
            .clone()
            .or_else(|| preset.map(|p| p.default_base_url.to_string()))
            .unwrap_or_else(|| OPENAI_API_URL.to_string());

        Self {
            http: Client::new(),
            name: config.provider.clone(),
            base_url,
            api_key: config.api_key.clone(),
            model_id: config.model_id.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            extra_headers: preset
                .map(|p| {
                    p.extra_headers
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn build_request(&self, model: &str, prompt: &str, params: &CompletionParams) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = params.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(OaiMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(OaiMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        ChatRequest {
            model: self.model_id.clone().unwrap_or_else(|| model.to_string()),
            messages,
            max_tokens: params.max_tokens.unwrap_or(self.max_tokens),
            temperature: Some(params.temperature.unwrap_or(self.temperature)),
            stream: false,
        }
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_response(body: &str) -> Result<String> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| WeftError::LlmParse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| WeftError::LlmParse("response has no message content".into()))
}

impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(
        &self,
        model: &str,
        prompt: &str,
        params: &CompletionParams,
    ) -> BoxFuture<'_, Result<String>> {
        let body = self.build_request(model, prompt, params);

        Box::pin(async move {
            debug!(provider = %self.name, model = %body.model, "Sending completion request");
            let mut req = self.http.post(&self.base_url).json(&body);

            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            for (k, v) in &self.extra_headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| WeftError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| WeftError::LlmRequest(e.to_string()))?;
            if !status.is_success() {
                return Err(WeftError::LlmRequest(format!("HTTP {}: {}", status, text)));
            }

            parse_response(&text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_configured_model_id() {
        let mut p = OpenAiProvider::new("deepseek", "http://localhost");
        p.model_id = Some("deepseek-chat-v3".into());
        let req = p.build_request("deepseek-chat", "hi", &CompletionParams::default());
        assert_eq!(req.model, "deepseek-chat-v3");
        assert_eq!(req.messages.len(), 1);
        assert!(!req.stream);
    }

    #[test]
    fn test_request_includes_system_prompt() {
        let p = OpenAiProvider::new("openai", "http://localhost");
        let params = CompletionParams {
            system: Some("be terse".into()),
            max_tokens: Some(64),
            temperature: Some(0.1),
        };
        let req = p.build_request("gpt-4o", "hi", &params);
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].content, "hi");
        assert_eq!(req.max_tokens, 64);
        assert_eq!(req.temperature, Some(0.1));
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;
        assert_eq!(parse_response(body).unwrap(), "hello");
    }

    #[test]
    fn test_parse_empty_choices() {
        let err = parse_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, WeftError::LlmParse(_)));
    }
}
