use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// Execution limits applied to every workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global node-dispatch budget per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Upper bound on a single handler invocation.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Wall-clock budget per instance unless the workflow sets its own.
    #[serde(default = "default_instance_timeout")]
    pub instance_timeout_secs: u64,
    /// Model used by `llm` nodes that name none.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Node-level retry. `max_retries = 0` disables it.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Capacity of the event bus channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            node_timeout_secs: default_node_timeout(),
            instance_timeout_secs: default_instance_timeout(),
            default_model: default_model(),
            retry: RetryConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_steps() -> usize { 500 }
fn default_node_timeout() -> u64 { 120 }
fn default_instance_timeout() -> u64 { 600 }
fn default_model() -> String { "deepseek-chat".to_string() }
fn default_event_capacity() -> usize { 256 }

/// Retry configuration, shared by node retry and LLM request retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given zero-based attempt, capped at
    /// `max_backoff_ms`, with 0.8x to 1.2x jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}

fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. `~/` is expanded.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> String { "~/.weft/weft.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.weft/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = workflow summaries only, 2 = every node event.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// One routable model. `name` is what workflow nodes refer to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Upstream model id; defaults to `name`.
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ModelConfig {
    pub fn upstream_model(&self) -> &str {
        self.model_id.as_deref().unwrap_or(&self.name)
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.7 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the SQLite database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database)
    }

    /// Resolve the JSONL log directory.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.weft/logs"),
        })
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_engine_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_steps, 500);
        assert_eq!(config.engine.instance_timeout_secs, 600);
        assert_eq!(config.engine.default_model, "deepseek-chat");
        assert_eq!(config.engine.retry.max_retries, 0);
        assert!(config.models.is_empty());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_models_and_retry_section() {
        let toml_str = r#"
[engine]
max_steps = 50

[engine.retry]
max_retries = 2
initial_backoff_ms = 10

[[models]]
name = "deepseek-chat"
base_url = "https://api.deepseek.com/v1/chat/completions"
api_key = "sk-test"

[[models]]
name = "fast"
model_id = "gpt-4o-mini"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_steps, 50);
        assert_eq!(config.engine.retry.max_retries, 2);
        assert_eq!(config.engine.retry.max_backoff_ms, 10_000);
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.model("fast").unwrap().upstream_model(), "gpt-4o-mini");
        assert_eq!(
            config.model("deepseek-chat").unwrap().upstream_model(),
            "deepseek-chat"
        );
        assert_eq!(config.model("deepseek-chat").unwrap().provider, "openai");
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let first = retry.backoff(0).as_millis() as u64;
        assert!((80..=120).contains(&first));
        let capped = retry.backoff(10).as_millis() as u64;
        assert!((800..=1_200).contains(&capped));
    }

    #[test]
    fn test_log_section_enables_log_dir() {
        let toml_str = r#"
[log]
log_dir = "/tmp/weft-logs"
level = 1
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/weft-logs")));
        assert_eq!(config.log.unwrap().level, 1);
    }
}
