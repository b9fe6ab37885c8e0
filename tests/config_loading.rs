use std::io::Write;

use weft_core::config::AppConfig;
use weft_core::error::WeftError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps = 200
node_timeout_secs = 30
instance_timeout_secs = 90
default_model = "fast"
event_capacity = 64

[engine.retry]
max_retries = 3
initial_backoff_ms = 50
max_backoff_ms = 400

[storage]
database = "/tmp/weft-test/weft.db"

[log]
log_dir = "/tmp/weft-test/logs"
level = 1

[[models]]
name = "fast"
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
max_tokens = 1024
temperature = 0.2

[[models]]
name = "deepseek-chat"
provider = "deepseek"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 200);
    assert_eq!(config.engine.node_timeout_secs, 30);
    assert_eq!(config.engine.instance_timeout_secs, 90);
    assert_eq!(config.engine.default_model, "fast");
    assert_eq!(config.engine.event_capacity, 64);
    assert_eq!(config.engine.retry.max_retries, 3);
    assert_eq!(config.engine.retry.max_backoff_ms, 400);

    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/tmp/weft-test/weft.db")
    );
    assert_eq!(
        config.log_dir(),
        Some(std::path::PathBuf::from("/tmp/weft-test/logs"))
    );
    assert_eq!(config.log.as_ref().map(|l| l.level), Some(1));

    let fast = config.model("fast").expect("fast model present");
    assert_eq!(fast.upstream_model(), "gpt-4o-mini");
    assert_eq!(fast.api_key, Some("sk-test-key".to_string()));
    assert_eq!(fast.max_tokens, 1024);

    let deepseek = config.model("deepseek-chat").expect("deepseek model present");
    assert_eq!(deepseek.provider, "deepseek");
    assert_eq!(deepseek.upstream_model(), "deepseek-chat");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[[models]]
name = "main"
api_key = "${WEFT_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.model("main").and_then(|m| m.api_key.clone()),
        Some("expanded-key-value".to_string())
    );

    std::env::remove_var("WEFT_TEST_API_KEY");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let missing = dir.path().join("absent.toml");

    let err = AppConfig::load(&missing).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));

    let config = AppConfig::load_or_default(&missing).expect("defaults");
    assert_eq!(config.engine.max_steps, 500);
    assert!(config.models.is_empty());
}

#[test]
fn test_malformed_config_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_steps = ").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}

#[test]
fn test_disabled_log_section_has_no_log_dir() {
    let config = weft_test_utils::test_config(
        r#"
[log]
enabled = false
log_dir = "/tmp/never"
"#,
    );
    assert!(config.log_dir().is_none());
}
