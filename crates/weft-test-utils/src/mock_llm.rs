use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{CompletionProvider, ModelRouter};
use weft_core::types::CompletionParams;

/// One `complete` call as the provider saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub prompt: String,
    pub params: CompletionParams,
}

#[derive(Default)]
struct ProviderState {
    script: VecDeque<std::result::Result<String, String>>,
    calls: Vec<RecordedCall>,
}

/// Completion provider that replays scripted replies in order, then
/// answers `"mock response"`. Clones share the script and call log.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.state.lock().unwrap().script.push_back(Ok(text.into()));
        self
    }

    /// Queue a failure surfaced as an LLM request error.
    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.state.lock().unwrap().script.push_back(Err(message.into()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(
        &self,
        model: &str,
        prompt: &str,
        params: &CompletionParams,
    ) -> BoxFuture<'_, Result<String>> {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(RecordedCall {
                model: model.to_string(),
                prompt: prompt.to_string(),
                params: params.clone(),
            });
            state.script.pop_front()
        };
        Box::pin(async move {
            match next {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(WeftError::LlmRequest(message)),
                None => Ok("mock response".to_string()),
            }
        })
    }
}

/// Model router over a fixed model→provider table.
#[derive(Clone, Default)]
pub struct MockRouter {
    models: HashMap<String, Arc<dyn CompletionProvider>>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, name: impl Into<String>, provider: MockProvider) -> Self {
        self.models.insert(name.into(), Arc::new(provider));
        self
    }
}

impl ModelRouter for MockRouter {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn CompletionProvider>> {
        self.models
            .get(model)
            .cloned()
            .ok_or_else(|| WeftError::ModelNotFound(model.to_string()))
    }
}
