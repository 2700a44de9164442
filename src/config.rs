//! Store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repository::RepositoryOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Settings of the shared repository cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_weight_bytes: u64,
    pub expire_after_access_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_weight_bytes: 128 * 1024 * 1024,
            expire_after_access_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// open the encrypted store at all
    pub enabled: bool,
    /// create new repositories with the encrypted backend
    pub encrypt_new_repositories: bool,
}

/// Configuration of a store instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of all project and repository data.
    pub data_dir: PathBuf,
    pub repository_cache: CacheConfig,
    pub max_commits_per_history: usize,
    pub max_watch_timeout_millis: u64,
    pub dek_unwrap_timeout_millis: u64,
    pub encryption: EncryptionConfig,
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            repository_cache: CacheConfig::default(),
            max_commits_per_history: 1000,
            max_watch_timeout_millis: 120_000,
            dek_unwrap_timeout_millis: 10_000,
            encryption: EncryptionConfig::default(),
            purge_interval_secs: 60,
        }
    }
}

impl StoreConfig {
    /// Create a configuration rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn cache(mut self, max_weight_bytes: u64, expire_after_access_secs: u64) -> Self {
        self.repository_cache = CacheConfig {
            max_weight_bytes,
            expire_after_access_secs,
        };
        self
    }

    pub fn max_commits_per_history(mut self, value: usize) -> Self {
        self.max_commits_per_history = value;
        self
    }

    pub fn max_watch_timeout_millis(mut self, value: u64) -> Self {
        self.max_watch_timeout_millis = value;
        self
    }

    pub fn dek_unwrap_timeout_millis(mut self, value: u64) -> Self {
        self.dek_unwrap_timeout_millis = value;
        self
    }

    /// Enable encryption; `encrypt_new` also makes it the default for new repositories.
    pub fn encryption(mut self, enabled: bool, encrypt_new: bool) -> Self {
        self.encryption = EncryptionConfig {
            enabled,
            encrypt_new_repositories: encrypt_new,
        };
        self
    }

    pub fn purge_interval_secs(mut self, value: u64) -> Self {
        self.purge_interval_secs = value;
        self
    }

    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            max_commits: self.max_commits_per_history,
            max_watch_timeout: Duration::from_millis(self.max_watch_timeout_millis),
        }
    }

    pub fn dek_unwrap_timeout(&self) -> Duration {
        Duration::from_millis(self.dek_unwrap_timeout_millis)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    /// the shared encrypted key-value store
    pub fn encryption_store_path(&self) -> PathBuf {
        self.data_dir.join("_encryption").join("encryption.sqlite")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.repository_cache.max_weight_bytes, 128 * 1024 * 1024);
        assert_eq!(config.max_commits_per_history, 1000);
        assert_eq!(config.repository_options().max_watch_timeout, Duration::from_secs(120));
        assert!(!config.encryption.enabled);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/srv/conf", "encryption": {"enabled": true}, "repository_cache": {"max_weight_bytes": 1024}}"#,
        )
        .unwrap();

        let config = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/conf"));
        assert!(config.encryption.enabled);
        assert!(!config.encryption.encrypt_new_repositories);
        assert_eq!(config.repository_cache.max_weight_bytes, 1024);
        assert_eq!(config.repository_cache.expire_after_access_secs, 300);
        assert_eq!(config.purge_interval_secs, 60);
    }

    #[test]
    fn invalid_json_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(StoreConfig::from_json_file(&path), Err(ConfigError::Invalid(_))));
    }
}
