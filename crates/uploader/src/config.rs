//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! chunk_size = 5242880
//! max_parallel_chunks = 3
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use docingest_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_THRESHOLD, MAX_FILE_SIZE};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Errors loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry settings as they appear on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

/// Upload engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Files at or above this size are chunked; smaller ones go direct.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,

    /// Largest accepted file.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Chunks in flight per task.
    #[serde(default = "default_parallelism")]
    pub max_parallel_chunks: usize,

    /// Tasks past `Queued` at the same time.
    #[serde(default = "default_parallelism")]
    pub max_active_tasks: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Lower bound for the per-chunk request timeout, in seconds.
    #[serde(default = "default_min_chunk_timeout_secs")]
    pub min_chunk_timeout_secs: u64,

    /// Slowest link the chunk timeout has to tolerate, in bytes/second.
    #[serde(default = "default_min_expected_throughput_bps")]
    pub min_expected_throughput_bps: u64,

    /// How long finished tasks stay queryable, in seconds.
    #[serde(default = "default_history_ttl_secs")]
    pub history_ttl_secs: u64,

    /// Speed calculation window, in seconds.
    #[serde(default = "default_progress_window_secs")]
    pub progress_window_secs: u64,

    /// Speed samples kept per task.
    #[serde(default = "default_progress_window_samples")]
    pub progress_window_samples: usize,

    /// Ask the server to discard the session when a task is canceled.
    #[serde(default)]
    pub abort_remote_on_cancel: bool,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_threshold() -> u64 {
    DEFAULT_CHUNK_THRESHOLD
}

fn default_max_file_size() -> u64 {
    MAX_FILE_SIZE
}

fn default_parallelism() -> usize {
    3
}

fn default_min_chunk_timeout_secs() -> u64 {
    5
}

fn default_min_expected_throughput_bps() -> u64 {
    64 * 1024
}

fn default_history_ttl_secs() -> u64 {
    600
}

fn default_progress_window_secs() -> u64 {
    5
}

fn default_progress_window_samples() -> usize {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_threshold: default_chunk_threshold(),
            max_file_size: default_max_file_size(),
            max_parallel_chunks: default_parallelism(),
            max_active_tasks: default_parallelism(),
            retry: RetryConfig::default(),
            min_chunk_timeout_secs: default_min_chunk_timeout_secs(),
            min_expected_throughput_bps: default_min_expected_throughput_bps(),
            history_ttl_secs: default_history_ttl_secs(),
            progress_window_secs: default_progress_window_secs(),
            progress_window_samples: default_progress_window_samples(),
            abort_remote_on_cancel: false,
        }
    }
}

impl EngineConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "engine configuration loaded");
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the settings can drive an upload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.chunk_size == 0 {
            return invalid("chunk_size must be greater than zero");
        }
        if self.max_file_size == 0 {
            return invalid("max_file_size must be greater than zero");
        }
        if self.max_parallel_chunks == 0 {
            return invalid("max_parallel_chunks must be at least 1");
        }
        if self.max_active_tasks == 0 {
            return invalid("max_active_tasks must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be a finite number >= 1.0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must not be below retry.base_delay_ms");
        }
        if self.min_expected_throughput_bps == 0 {
            return invalid("min_expected_throughput_bps must be greater than zero");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    /// Per-chunk request timeout: the time a full chunk takes at the
    /// minimum expected throughput, never below the configured floor.
    pub fn chunk_timeout(&self) -> Duration {
        let floor = Duration::from_secs(self.min_chunk_timeout_secs);
        let throughput = self.min_expected_throughput_bps.max(1);
        let scaled = Duration::from_secs(self.chunk_size.div_ceil(throughput));
        floor.max(scaled)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn progress_window(&self) -> Duration {
        Duration::from_secs(self.progress_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.chunk_threshold, 10 * 1024 * 1024);
        assert_eq!(config.max_file_size, 500 * 1024 * 1024);
        assert_eq!(config.max_parallel_chunks, 3);
        assert_eq!(config.max_active_tasks, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.abort_remote_on_cancel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_is_default() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_toml_overrides() {
        let config = EngineConfig::from_toml(
            r#"
            chunk_size = 1048576
            max_parallel_chunks = 6

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.max_parallel_chunks, 6);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.max_active_tasks, 3);
    }

    #[test]
    fn rejects_invalid_values() {
        for doc in [
            "chunk_size = 0",
            "max_parallel_chunks = 0",
            "max_active_tasks = 0",
            "[retry]\nmax_attempts = 0",
            "[retry]\nbackoff_factor = 0.5",
            "[retry]\nbase_delay_ms = 9000\nmax_delay_ms = 100",
        ] {
            assert!(
                matches!(EngineConfig::from_toml(doc), Err(ConfigError::Invalid(_))),
                "{doc}"
            );
        }
        assert!(matches!(
            EngineConfig::from_toml("chunk_size = \"big\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn chunk_timeout_scales_with_chunk_size() {
        let config = EngineConfig::default();
        // 5 MiB at 64 KiB/s.
        assert_eq!(config.chunk_timeout(), Duration::from_secs(80));

        let small = EngineConfig {
            chunk_size: 1024,
            ..EngineConfig::default()
        };
        assert_eq!(small.chunk_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "max_active_tasks = 1\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_active_tasks, 1);

        assert!(matches!(
            EngineConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
