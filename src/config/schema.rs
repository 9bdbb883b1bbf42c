//! Configuration schema for attach-cache
//!
//! Configuration is stored at `~/.config/attach-cache/config.toml`

use super::ConfigManager;
use crate::cache::lock::DEFAULT_LOCK_TIMEOUT;
use crate::cache::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Upload cache settings
    pub cache: CacheConfig,

    /// Remote destination settings
    pub remote: RemoteConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Record uploads and evictions in the activity log
    pub activity_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            activity_log: true,
        }
    }
}

/// What to do when the cache database cannot be read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Refuse to run and tell the user how to fix it
    #[default]
    Fail,
    /// Warn and continue without a cache
    Bypass,
}

/// Upload cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the upload cache (default: true)
    pub enabled: bool,

    /// Database file (default: platform cache dir)
    pub path: Option<PathBuf>,

    /// Digest algorithm for file content
    pub hash_algorithm: HashAlgorithm,

    /// Forget entries older than N days (0 = disabled)
    pub ttl_days: u32,

    /// Keep the cache when the CLI exits
    pub preserve_on_exit: bool,

    /// Evict least recently used entries above this many MB (0 = unbounded)
    pub max_total_mb: u64,

    /// Seconds to wait for another process uploading the same file
    pub lock_timeout_secs: u64,

    /// Behaviour when the database is unreadable
    pub on_corruption: CorruptionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            hash_algorithm: HashAlgorithm::Sha256,
            ttl_days: 14,
            preserve_on_exit: true,
            max_total_mb: 0,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs(),
            on_corruption: CorruptionPolicy::Fail,
        }
    }
}

impl CacheConfig {
    /// Configured database path, or the platform default
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(ConfigManager::default_database_path)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Remote destination configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Directory backing the filesystem remote (default: platform data dir)
    pub root: Option<PathBuf>,
}

impl RemoteConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(ConfigManager::default_remote_root)
    }
}
