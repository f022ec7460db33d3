//! CLI configuration.
//!
//! An optional TOML file holds the service location and engine tuning:
//!
//! ```toml
//! base_url = "https://docs.example.com/api"
//! token = "..."
//!
//! [engine]
//! max_parallel_chunks = 4
//! ```
//!
//! Command-line flags override individual fields.

use std::path::Path;
use std::time::Duration;

use docingest_uploader::EngineConfig;
use serde::{Deserialize, Serialize};

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service base URL.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,

    /// Timeout for single-request uploads of small files, in seconds.
    #[serde(default = "default_direct_timeout_secs")]
    pub direct_timeout_secs: u64,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_direct_timeout_secs() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            direct_timeout_secs: default_direct_timeout_secs(),
            engine: EngineConfig::default(),
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub chunk_size: Option<u64>,
    pub parallel_chunks: Option<usize>,
    pub active_tasks: Option<usize>,
}

impl Config {
    /// Loads configuration from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Applies command-line values on top of the file values.
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if overrides.base_url.is_some() {
            self.base_url = overrides.base_url;
        }
        if overrides.token.is_some() {
            self.token = overrides.token;
        }
        if let Some(chunk_size) = overrides.chunk_size {
            self.engine.chunk_size = chunk_size;
        }
        if let Some(parallel) = overrides.parallel_chunks {
            self.engine.max_parallel_chunks = parallel;
        }
        if let Some(active) = overrides.active_tasks {
            self.engine.max_active_tasks = active;
        }
        self
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert!(config.base_url.is_none());
        assert_eq!(config.direct_timeout(), Duration::from_secs(120));
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn partial_toml_keeps_engine_defaults() {
        let toml_str = r#"
            base_url = "https://docs.example.com/api"

            [engine]
            max_parallel_chunks = 5
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("https://docs.example.com/api"));
        assert_eq!(config.direct_timeout_secs, 120);
        assert_eq!(config.engine.max_parallel_chunks, 5);
        assert_eq!(config.engine.chunk_size, EngineConfig::default().chunk_size);
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("upload.toml");
        std::fs::write(&path, "token = \"abc\"\ndirect_timeout_secs = 30\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(config.direct_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn load_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&tmp.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn flags_override_file_values() {
        let config = Config {
            base_url: Some("https://file.example.com".into()),
            token: Some("from-file".into()),
            ..Config::default()
        };

        let config = config.with_overrides(Overrides {
            base_url: Some("https://flag.example.com".into()),
            chunk_size: Some(1024 * 1024),
            parallel_chunks: Some(6),
            ..Overrides::default()
        });

        assert_eq!(config.base_url.as_deref(), Some("https://flag.example.com"));
        assert_eq!(config.token.as_deref(), Some("from-file"));
        assert_eq!(config.engine.chunk_size, 1024 * 1024);
        assert_eq!(config.engine.max_parallel_chunks, 6);
        assert_eq!(config.engine.max_active_tasks, 3);
    }
}
