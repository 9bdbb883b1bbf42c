//! Retention: TTL and LRU eviction
//!
//! Retention only bounds local storage. It forgets local mappings and never
//! deletes anything on the remote side; an evicted digest is simply
//! uploaded again the next time it is resolved. Sweeps never wait on upload
//! locks, so a resolve racing a sweep may see its entry vanish and falls
//! back to the miss path. Idle lock files left by crashed uploads are
//! removed along with the entries.

use super::lock::UploadLocks;
use super::signature::PathSignatureIndex;
use super::store::{CacheEntry, CacheStore};
use crate::config::schema::CacheConfig;
use crate::error::CacheResult;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Why a sweep removed entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SweepReason {
    /// Entries older than the configured age
    Expired,
    /// Everything, because the cache is not preserved
    PreserveDisabled,
    /// Least recently used entries, to fit the size bound
    SizeLimit,
}

impl fmt::Display for SweepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Expired => "expired",
            Self::PreserveDisabled => "preserve-disabled",
            Self::SizeLimit => "size-limit",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reason: SweepReason,
    pub scanned: usize,
    pub removed: usize,
    pub freed_bytes: u64,
    pub signatures_pruned: usize,
    pub locks_pruned: usize,
}

impl SweepReport {
    fn new(reason: SweepReason) -> Self {
        Self {
            reason,
            scanned: 0,
            removed: 0,
            freed_bytes: 0,
            signatures_pruned: 0,
            locks_pruned: 0,
        }
    }
}

/// Retention settings taken from the cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum entry age in days, 0 disables age eviction
    pub ttl_days: u32,
    /// Keep the cache when the CLI exits
    pub preserve_on_exit: bool,
    /// LRU bound on recorded content size, 0 disables it
    pub max_total_bytes: u64,
}

impl From<&CacheConfig> for RetentionPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl_days: config.ttl_days,
            preserve_on_exit: config.preserve_on_exit,
            max_total_bytes: config.max_total_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// Enforces the retention policy over a cache store
#[derive(Debug, Clone)]
pub struct RetentionManager {
    store: CacheStore,
    signatures: Option<PathSignatureIndex>,
    locks: Option<UploadLocks>,
}

impl RetentionManager {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            signatures: None,
            locks: None,
        }
    }

    /// Also prune the path signature index during sweeps
    pub fn with_signatures(mut self, signatures: PathSignatureIndex) -> Self {
        self.signatures = Some(signatures);
        self
    }

    /// Also remove idle upload lock files during sweeps
    pub fn with_locks(mut self, locks: UploadLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    fn prune_auxiliary(
        &self,
        report: &mut SweepReport,
        clear_signatures: bool,
    ) -> CacheResult<()> {
        if let Some(signatures) = &self.signatures {
            report.signatures_pruned = if clear_signatures {
                signatures.clear()?
            } else {
                signatures.prune_missing()?
            };
        }
        if let Some(locks) = &self.locks {
            report.locks_pruned = locks.prune_idle()?;
        }
        Ok(())
    }

    /// Delete entries created more than `max_age` before `now`
    ///
    /// With `preserve` false every entry is deleted regardless of age.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
        preserve: bool,
    ) -> CacheResult<SweepReport> {
        if !preserve {
            let stats = self.store.stats()?;
            let removed = self.store.clear()?;
            let mut report = SweepReport::new(SweepReason::PreserveDisabled);
            report.scanned = removed;
            report.removed = removed;
            report.freed_bytes = stats.total_bytes;
            self.prune_auxiliary(&mut report, true)?;
            info!("Cleared {} cache entries (preserve disabled)", removed);
            return Ok(report);
        }

        let cutoff = now - max_age;
        let mut report = SweepReport::new(SweepReason::Expired);
        for entry in self.store.list_expirable(cutoff) {
            let entry = entry?;
            report.scanned += 1;
            if self.store.delete_if_created_before(&entry.digest, cutoff)? {
                debug!(digest = %entry.digest.short(), "expired");
                report.removed += 1;
                report.freed_bytes += entry.size_bytes;
            }
        }

        self.prune_auxiliary(&mut report, false)?;
        if report.removed > 0 {
            info!(
                "Expired {} cache entries older than {} days",
                report.removed,
                max_age.num_days()
            );
        }
        Ok(report)
    }

    /// Entries a sweep at `now` would remove, without removing them
    pub fn plan_sweep(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> CacheResult<Vec<CacheEntry>> {
        self.store.list_expirable(now - max_age).collect()
    }

    /// Evict least recently used entries until the recorded size fits
    pub fn enforce_size_limit(&self, max_bytes: u64) -> CacheResult<SweepReport> {
        let mut report = SweepReport::new(SweepReason::SizeLimit);
        let mut total = self.store.stats()?.total_bytes;
        if total <= max_bytes {
            return Ok(report);
        }

        for (digest, size, last_accessed) in self.store.lru_order()? {
            if total <= max_bytes {
                break;
            }
            report.scanned += 1;
            // skip entries touched since we listed them
            if self.store.delete_if_idle_since(&digest, last_accessed)? {
                debug!(digest = %digest.short(), "evicted (lru)");
                total = total.saturating_sub(size);
                report.removed += 1;
                report.freed_bytes += size;
            }
        }

        info!(
            "Evicted {} cache entries to fit {} bytes",
            report.removed, max_bytes
        );
        Ok(report)
    }

    /// Startup hook: age sweep, then the size bound
    pub fn on_startup(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> CacheResult<Vec<SweepReport>> {
        let mut reports = Vec::new();
        if policy.ttl_days > 0 {
            reports.push(self.sweep(now, Duration::days(i64::from(policy.ttl_days)), true)?);
        }
        if policy.max_total_bytes > 0 {
            reports.push(self.enforce_size_limit(policy.max_total_bytes)?);
        }
        Ok(reports)
    }

    /// Shutdown hook: drop everything unless the cache is preserved
    pub fn on_shutdown(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> CacheResult<Option<SweepReport>> {
        if policy.preserve_on_exit {
            return Ok(None);
        }
        self.sweep(now, Duration::zero(), false).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::db::CacheDatabase;
    use crate::cache::digest::{ContentHasher, FileDigest, HashAlgorithm};
    use crate::cache::signature::FileStat;
    use crate::remote::RemoteId;
    use std::path::Path;
    use std::sync::Arc;

    fn setup() -> (CacheStore, PathSignatureIndex) {
        let db = Arc::new(CacheDatabase::in_memory().unwrap());
        (
            CacheStore::new(db.clone()),
            PathSignatureIndex::new(db, HashAlgorithm::Sha256),
        )
    }

    fn add(store: &CacheStore, name: &str, size: u64, age: Duration) -> FileDigest {
        let digest = ContentHasher::default().digest_bytes(name.as_bytes());
        store
            .put(&digest, &"exec".into(), &RemoteId::new(name), size)
            .unwrap();
        store
            .put(&digest, &"search".into(), &RemoteId::new(format!("{name}-s")), size)
            .unwrap();
        let at = Utc::now() - age;
        store.set_timestamps(&digest, at, at).unwrap();
        digest
    }

    #[test]
    fn sweep_removes_only_old_entries() {
        let (store, _) = setup();
        let old = add(&store, "old", 10, Duration::days(30));
        let young = add(&store, "young", 10, Duration::days(1));

        let report = RetentionManager::new(store.clone())
            .sweep(Utc::now(), Duration::days(7), true)
            .unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.freed_bytes, 10);
        // digest granularity: every destination goes with it
        assert!(store.entry(&old).unwrap().is_none());
        let kept = store.entry(&young).unwrap().unwrap();
        assert_eq!(kept.remote_ids.len(), 2);
    }

    #[test]
    fn sweep_without_preserve_removes_everything() {
        let (store, signatures) = setup();
        add(&store, "old", 10, Duration::days(30));
        add(&store, "young", 10, Duration::minutes(1));
        signatures
            .record(
                Path::new("/tmp/x"),
                &FileStat {
                    size_bytes: 1,
                    mtime_ns: 1,
                },
                &ContentHasher::default().digest_bytes(b"x"),
            )
            .unwrap();

        let report = RetentionManager::new(store.clone())
            .with_signatures(signatures.clone())
            .sweep(Utc::now(), Duration::days(365), false)
            .unwrap();

        assert_eq!(report.reason, SweepReason::PreserveDisabled);
        assert_eq!(report.removed, 2);
        assert_eq!(store.stats().unwrap().entries, 0);
        assert_eq!(signatures.count().unwrap(), 0);
    }

    #[test]
    fn sweep_is_restartable() {
        let (store, _) = setup();
        add(&store, "a", 1, Duration::days(10));
        let manager = RetentionManager::new(store.clone());

        assert_eq!(manager.sweep(Utc::now(), Duration::days(5), true).unwrap().removed, 1);
        assert_eq!(manager.sweep(Utc::now(), Duration::days(5), true).unwrap().removed, 0);
    }

    #[test]
    fn plan_sweep_does_not_delete() {
        let (store, _) = setup();
        add(&store, "a", 1, Duration::days(10));
        let manager = RetentionManager::new(store.clone());

        let plan = manager.plan_sweep(Utc::now(), Duration::days(5)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(store.stats().unwrap().entries, 1);
    }

    #[test]
    fn size_limit_evicts_least_recently_used() {
        let (store, _) = setup();
        let oldest = add(&store, "oldest", 40, Duration::hours(3));
        let middle = add(&store, "middle", 40, Duration::hours(2));
        let newest = add(&store, "newest", 40, Duration::hours(1));

        let report = RetentionManager::new(store.clone())
            .enforce_size_limit(90)
            .unwrap();

        assert_eq!(report.removed, 1);
        assert!(store.entry(&oldest).unwrap().is_none());
        assert!(store.entry(&middle).unwrap().is_some());
        assert!(store.entry(&newest).unwrap().is_some());
    }

    #[test]
    fn size_limit_noop_when_under_bound() {
        let (store, _) = setup();
        add(&store, "a", 10, Duration::hours(1));
        let report = RetentionManager::new(store).enforce_size_limit(100).unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn lifecycle_hooks_follow_policy() {
        let (store, _) = setup();
        add(&store, "old", 10, Duration::days(20));
        add(&store, "new", 10, Duration::hours(1));
        let manager = RetentionManager::new(store.clone());

        let policy = RetentionPolicy {
            ttl_days: 14,
            preserve_on_exit: true,
            max_total_bytes: 0,
        };
        let reports = manager.on_startup(&policy, Utc::now()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(store.stats().unwrap().entries, 1);
        assert!(manager.on_shutdown(&policy, Utc::now()).unwrap().is_none());

        let discard = RetentionPolicy {
            preserve_on_exit: false,
            ..policy
        };
        let report = manager.on_shutdown(&discard, Utc::now()).unwrap().unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(store.stats().unwrap().entries, 0);
    }

    #[test]
    fn policy_from_config() {
        let config = CacheConfig {
            max_total_mb: 2,
            ..CacheConfig::default()
        };
        let policy = RetentionPolicy::from(&config);
        assert_eq!(policy.max_total_bytes, 2 * 1024 * 1024);
        assert_eq!(policy.ttl_days, config.ttl_days);
    }
}
