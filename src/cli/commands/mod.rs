//! CLI command implementations

pub mod cache;
pub mod config;
pub mod resolve;
pub mod verify;

pub use cache::execute as cache;
pub use config::execute as config;
pub use resolve::execute as resolve;
pub use verify::execute as verify;

use crate::activity::ActivityLog;
use crate::cache::{CacheHandles, RetentionPolicy, SweepReport};
use crate::config::Config;
use crate::coordinator::UploadCoordinator;
use crate::error::CacheResult;
use crate::remote::DirectoryRemote;
use chrono::Utc;
use tracing::debug;

/// Cache opened for a resolving command, with retention hooks around it
///
/// `open` runs the startup sweep and `close` runs the shutdown sweep. With
/// the cache disabled, bypassed or skipped both are no-ops.
pub(crate) struct CacheSession {
    handles: Option<CacheHandles>,
    policy: RetentionPolicy,
    activity: ActivityLog,
}

impl CacheSession {
    pub(crate) async fn open(config: &Config, skip_cache: bool) -> CacheResult<Self> {
        let activity = ActivityLog::new(config);
        let handles = if skip_cache {
            debug!("Cache skipped for this invocation");
            None
        } else {
            CacheHandles::open_configured(&config.cache)?
        };

        let session = Self {
            handles,
            policy: RetentionPolicy::from(&config.cache),
            activity,
        };

        if let Some(handles) = &session.handles {
            let reports = handles.retention().on_startup(&session.policy, Utc::now())?;
            for report in &reports {
                log_sweep(&session.activity, report).await;
            }
        }
        Ok(session)
    }

    /// Coordinator uploading to the configured filesystem remote
    pub(crate) fn coordinator(&self, config: &Config) -> UploadCoordinator<DirectoryRemote> {
        let remote = DirectoryRemote::new(config.remote.root_dir());
        UploadCoordinator::from_parts(remote, config.cache.hash_algorithm, self.handles.clone())
            .with_activity_log(self.activity.clone())
    }

    pub(crate) async fn close(self) -> CacheResult<()> {
        if let Some(handles) = &self.handles {
            if let Some(report) = handles.retention().on_shutdown(&self.policy, Utc::now())? {
                log_sweep(&self.activity, &report).await;
            }
        }
        Ok(())
    }
}

/// Record a sweep that removed something
pub(crate) async fn log_sweep(activity: &ActivityLog, report: &SweepReport) {
    if report.removed == 0 && report.signatures_pruned == 0 && report.locks_pruned == 0 {
        return;
    }
    activity
        .log("retention.swept", || {
            serde_json::to_value(report).unwrap_or_default()
        })
        .await;
}
