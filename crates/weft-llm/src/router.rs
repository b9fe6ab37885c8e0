use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use weft_core::config::AppConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::{CompletionProvider, ModelRouter};

/// Model router backed by a fixed name → provider table.
#[derive(Default)]
pub struct ConfiguredRouter {
    providers: HashMap<String, Arc<dyn CompletionProvider>>,
}

impl ConfiguredRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a router from the `[[models]]` config section. Models whose
    /// provider cannot be created are skipped with a warning so one bad
    /// entry does not disable the rest.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut router = Self::new();
        for model in &config.models {
            match crate::create_provider(model) {
                Ok(provider) => router.register(model.name.clone(), provider),
                Err(e) => warn!(model = %model.name, error = %e, "Skipping model"),
            }
        }
        router
    }

    pub fn register(&mut self, model: impl Into<String>, provider: Arc<dyn CompletionProvider>) {
        self.providers.insert(model.into(), provider);
    }

    pub fn models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ModelRouter for ConfiguredRouter {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn CompletionProvider>> {
        self.providers
            .get(model)
            .cloned()
            .ok_or_else(|| WeftError::ModelNotFound(model.to_string()))
    }
}
