//! Activity log for cache events
//!
//! One JSON object per line in `<state_dir>/attach-cache/activity.log`.
//! Uploads, invalidations, sweeps and clears are recorded; turn it off with
//! `general.activity_log = false`.

use crate::config::{schema::Config, ConfigManager};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Serialize)]
struct Event<'a> {
    timestamp: DateTime<Utc>,
    event: &'a str,
    data: serde_json::Value,
}

/// Append-only JSON-lines event sink
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    target: Option<PathBuf>,
}

impl ActivityLog {
    pub fn new(config: &Config) -> Self {
        if config.general.activity_log {
            Self::at(ConfigManager::activity_log_path())
        } else {
            Self::disabled()
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { target: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Record `event`. Write failures only produce a warning.
    ///
    /// `data` is only built when the log is enabled.
    pub async fn log(&self, event: &str, data: impl FnOnce() -> serde_json::Value) {
        let Some(target) = &self.target else {
            return;
        };

        let record = Event {
            timestamp: Utc::now(),
            event,
            data: data(),
        };
        let line = match serde_json::to_vec(&record) {
            Ok(mut bytes) => {
                bytes.push(b'\n');
                bytes
            }
            Err(e) => {
                warn!(event, "Activity event not serializable: {}", e);
                return;
            }
        };

        if let Err(e) = append_line(target, &line).await {
            warn!("Could not append to {}: {}", target.display(), e);
        }
    }
}

async fn append_line(target: &Path, line: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = target.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await?;
    file.write_all(line).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn records_event_with_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("activity.log");
        let log = ActivityLog::at(&path);

        log.log("upload.completed", || {
            serde_json::json!({"destination": "search-index"})
        })
        .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["event"], "upload.completed");
        assert_eq!(parsed["data"]["destination"], "search-index");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn each_event_is_its_own_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activity.log");
        let log = ActivityLog::at(&path);

        log.log("retention.swept", || serde_json::json!({"removed": 1})).await;
        log.log("cache.cleared", || serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let events: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"].to_string())
            .collect();
        assert_eq!(events, ["\"retention.swept\"", "\"cache.cleared\""]);
    }

    #[tokio::test]
    async fn disabled_log_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.general.activity_log = false;

        let log = ActivityLog::new(&config);
        log.log("cache.cleared", || panic!("data built for a disabled log")).await;

        assert!(!log.is_enabled());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
