//! Shared test utilities, mocks, and fixtures for Weft crates.

pub mod fixtures;
mod memory_store;
mod mock_llm;
mod mock_services;
mod trace;

pub use memory_store::MemoryStore;
pub use mock_llm::{MockProvider, MockRouter, RecordedCall};
pub use mock_services::{MockAgents, MockRetriever, MockSkills};
pub use trace::{RecordedSpan, RecordingTraceSink};

use std::io::Write;
use std::path::PathBuf;

use weft_core::config::AppConfig;

/// Parse an in-memory TOML snippet as application config.
pub fn test_config(toml_str: &str) -> AppConfig {
    toml::from_str(toml_str).expect("test config should parse")
}

/// Write `contents` to `name` inside a fresh temp dir. The dir is returned
/// so it lives as long as the caller needs the file.
pub fn write_temp_file(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    (dir, path)
}
