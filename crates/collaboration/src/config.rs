/// Collaboration server configuration
/// Loaded from TOML; every field has a default so partial files work
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{CollaborationError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,

    /// Upper bound on one revision persistence call
    pub append_timeout_ms: u64,

    pub recovery: RecoveryConfig,

    /// Participants silent for longer than this are dropped
    pub keep_alive_timeout_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            append_timeout_ms: 2_000,
            recovery: RecoveryConfig::default(),
            keep_alive_timeout_ms: 60_000,
        }
    }
}

impl CollabConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CollaborationError::ConfigError(e.to_string()))
    }

    /// Read a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CollaborationError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    JsonFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Directory for the JSON file backend
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("collab-data"),
        }
    }
}

/// How clients retry recovery and how long they wait on a revision gap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub gap_timeout_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 5_000,
            gap_timeout_ms: 3_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.recovery.max_retries, 5);
        assert_eq!(config.recovery.retry_delay_ms, 5_000);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.append_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_toml() {
        let config = CollabConfig::from_toml_str(
            r#"
            append_timeout_ms = 500

            [storage]
            backend = "json_file"
            data_dir = "/var/lib/collab"

            [recovery]
            max_retries = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.append_timeout_ms, 500);
        assert_eq!(config.storage.backend, StorageBackend::JsonFile);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/collab"));
        assert_eq!(config.recovery.max_retries, 2);
        assert_eq!(config.recovery.retry_delay_ms, 5_000);
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_invalid_toml() {
        let result = CollabConfig::from_toml_str("append_timeout_ms = \"soon\"");
        assert!(matches!(result, Err(CollaborationError::ConfigError(_))));
    }
}
