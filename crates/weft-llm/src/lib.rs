pub mod openai;
pub mod presets;
pub mod retry;
pub mod router;

use std::sync::Arc;

use weft_core::config::ModelConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::CompletionProvider;

pub use openai::OpenAiProvider;
pub use retry::RetryingProvider;
pub use router::ConfiguredRouter;

/// Create a completion provider for one configured model.
///
/// Every supported provider speaks the OpenAI chat completions protocol;
/// the name only selects the preset endpoint. A `retry` section wraps the
/// provider in a [`RetryingProvider`].
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn CompletionProvider>> {
    let preset = presets::get_preset(&config.provider);
    if preset.is_none() && config.provider != "openai" && config.base_url.is_none() {
        return Err(WeftError::UnsupportedProvider(config.provider.clone()));
    }

    let provider = OpenAiProvider::from_config(config, preset.as_ref());
    Ok(match &config.retry {
        Some(retry) if retry.max_retries > 0 => {
            Arc::new(RetryingProvider::new(Box::new(provider), retry.clone()))
        }
        _ => Arc::new(provider),
    })
}
