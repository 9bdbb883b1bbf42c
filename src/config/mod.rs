//! Configuration management for attach-cache
//!
//! | What | Where |
//! |------|-------|
//! | config file | `<config_dir>/attach-cache/config.toml` |
//! | cache database | `<cache_dir>/attach-cache/cache.db` |
//! | activity log | `<state_dir>/attach-cache/activity.log` |
//! | filesystem remote | `<data_local_dir>/attach-cache/remote/` |

pub mod schema;

pub use schema::Config;

use crate::error::{CacheError, CacheResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const APP_DIR: &str = "attach-cache";

/// `<base>/attach-cache`, falling back to the working directory
fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

/// Loads and saves the TOML configuration file
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn default_config_path() -> PathBuf {
        app_dir(dirs::config_dir()).join("config.toml")
    }

    pub fn default_database_path() -> PathBuf {
        app_dir(dirs::cache_dir()).join("cache.db")
    }

    pub fn state_dir() -> PathBuf {
        app_dir(dirs::state_dir().or_else(dirs::data_local_dir))
    }

    pub fn activity_log_path() -> PathBuf {
        Self::state_dir().join("activity.log")
    }

    pub fn default_remote_root() -> PathBuf {
        app_dir(dirs::data_local_dir()).join("remote")
    }

    /// Path this manager reads and writes
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Read the config file; a missing file means all defaults
    pub async fn load(&self) -> CacheResult<Config> {
        match tokio::fs::read_to_string(&self.config_path).await {
            Ok(content) => Self::parse(&self.config_path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "No config at {}, using defaults",
                    self.config_path.display()
                );
                Ok(Config::default())
            }
            Err(e) => Err(CacheError::io(
                format!("reading config from {}", self.config_path.display()),
                e,
            )),
        }
    }

    fn parse(path: &Path, content: &str) -> CacheResult<Config> {
        toml::from_str(content).map_err(|e| CacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Write `config` back, creating the parent directory
    pub async fn save(&self, config: &Config) -> CacheResult<()> {
        if let Some(dir) = self.config_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| CacheError::ConfigDirCreate {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let rendered = toml::to_string_pretty(config)?;
        tokio::fs::write(&self.config_path, rendered)
            .await
            .map_err(|e| {
                CacheError::io(format!("writing config to {}", self.config_path.display()), e)
            })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
