//! Upload coordinator
//!
//! Resolves a local file to one remote identifier per requested
//! destination, uploading only on a genuine cache miss. Uploads of the same
//! `(digest, destination)` are serialized by a file lock and double-checked
//! against the store once the lock is held, so content is uploaded at most
//! once per destination even across concurrent processes.

use crate::activity::ActivityLog;
use crate::cache::{CacheHandles, ContentHasher, FileDigest, FileStat, HashAlgorithm};
use crate::error::{CacheError, CacheResult, DestinationFailure};
use crate::remote::{DestinationKey, RemoteError, RemoteId, RemoteOutcome, RemoteUploader};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A file that keeps changing under us is hashed at most this many times
const MAX_HASH_ATTEMPTS: usize = 3;

/// Identifiers resolved for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Canonical path that was resolved
    #[serde(serialize_with = "serialize_lossy_path")]
    pub path: PathBuf,
    /// Digest of its content
    pub digest: FileDigest,
    pub size_bytes: u64,
    /// Identifier per requested destination
    pub remote_ids: BTreeMap<DestinationKey, RemoteId>,
    /// Destinations that needed a fresh upload during this call
    pub uploaded: BTreeSet<DestinationKey>,
}

impl Resolution {
    pub fn remote_id(&self, destination: &DestinationKey) -> Option<&RemoteId> {
        self.remote_ids.get(destination)
    }

    pub fn was_uploaded(&self, destination: &DestinationKey) -> bool {
        self.uploaded.contains(destination)
    }
}

/// Paths need not be UTF-8; render them the way they are displayed
fn serialize_lossy_path<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&path.to_string_lossy())
}

/// Front door of the upload cache
pub struct UploadCoordinator<U> {
    uploader: U,
    hasher: ContentHasher,
    cache: Option<CacheHandles>,
    activity: ActivityLog,
}

impl<U: RemoteUploader> UploadCoordinator<U> {
    /// Coordinator backed by a cache
    pub fn new(uploader: U, cache: CacheHandles) -> Self {
        let algorithm = cache.signatures.algorithm();
        Self::from_parts(uploader, algorithm, Some(cache))
    }

    /// Coordinator that uploads on every call and remembers nothing
    pub fn uncached(uploader: U, algorithm: HashAlgorithm) -> Self {
        Self::from_parts(uploader, algorithm, None)
    }

    pub fn from_parts(uploader: U, algorithm: HashAlgorithm, cache: Option<CacheHandles>) -> Self {
        if cache.is_none() {
            warn!("Upload cache is not active; every file will be uploaded");
        }
        Self {
            uploader,
            hasher: ContentHasher::new(algorithm),
            cache,
            activity: ActivityLog::disabled(),
        }
    }

    pub fn with_activity_log(mut self, activity: ActivityLog) -> Self {
        self.activity = activity;
        self
    }

    pub fn cache(&self) -> Option<&CacheHandles> {
        self.cache.as_ref()
    }

    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    /// Remote identifier for `path` on each of `destinations`
    ///
    /// Destinations are resolved independently. If some fail, the others
    /// stay resolved and persisted, and the error lists every failure by
    /// destination. A single requested destination that fails returns its
    /// error directly.
    pub async fn resolve_or_upload(
        &self,
        path: &Path,
        destinations: &BTreeSet<DestinationKey>,
    ) -> CacheResult<Resolution> {
        let path = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| CacheError::hash_failure(path, e))?;
        let (digest, stat) = self.identify(&path).await?;

        let results = join_all(destinations.iter().map(|destination| {
            self.resolve_destination(&path, &digest, stat.size_bytes, destination)
        }))
        .await;

        let mut remote_ids = BTreeMap::new();
        let mut uploaded = BTreeSet::new();
        let mut failures = Vec::new();
        for (destination, result) in destinations.iter().zip(results) {
            match result {
                Ok((id, fresh)) => {
                    if fresh {
                        uploaded.insert(destination.clone());
                    }
                    remote_ids.insert(destination.clone(), id);
                }
                Err(error) => {
                    warn!("Resolving {} for {} failed: {}", path.display(), destination, error);
                    failures.push(DestinationFailure {
                        destination: destination.clone(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            return Ok(Resolution {
                path,
                digest,
                size_bytes: stat.size_bytes,
                remote_ids,
                uploaded,
            });
        }
        if remote_ids.is_empty() && failures.len() == 1 {
            if let Some(failure) = failures.pop() {
                return Err(failure.error);
            }
        }
        Err(CacheError::PartialResolution {
            resolved: remote_ids,
            failures,
        })
    }

    /// Tell the cache that `stale` no longer exists on the remote
    ///
    /// Forgets it only if it is still the stored identifier, so the next
    /// resolution for that destination uploads again. Other destinations of
    /// the same digest are untouched. Returns whether anything was removed.
    pub async fn report_not_found(
        &self,
        digest: &FileDigest,
        destination: &DestinationKey,
        stale: &RemoteId,
    ) -> CacheResult<bool> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };

        let removed = cache.store.invalidate_if(digest, destination, stale)?;
        if removed {
            info!("Remote forgot {} on {}; will re-upload", stale, destination);
            self.activity
                .log("cache.invalidated", || {
                    serde_json::json!({
                        "digest": digest.to_string(),
                        "destination": destination.as_str(),
                        "remote_id": stale.as_str(),
                    })
                })
                .await;
        }
        Ok(removed)
    }

    /// Resolve `path` for `destination` and run `op` with the identifier
    ///
    /// If `op` reports the identifier as not found, the stale mapping is
    /// reconciled and `op` runs once more with a freshly uploaded one.
    pub async fn with_remote<T, F, Fut>(
        &self,
        path: &Path,
        destination: &DestinationKey,
        mut op: F,
    ) -> CacheResult<T>
    where
        F: FnMut(RemoteId) -> Fut,
        Fut: Future<Output = Result<RemoteOutcome<T>, RemoteError>>,
    {
        let wanted = BTreeSet::from([destination.clone()]);
        let mut reconciled = false;

        loop {
            let resolution = self.resolve_or_upload(path, &wanted).await?;
            let id = resolution.remote_id(destination).cloned().ok_or_else(|| {
                CacheError::Internal(format!("resolution is missing {}", destination))
            })?;

            let outcome = match op(id.clone()).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_not_found() => RemoteOutcome::NotFound,
                Err(source) => {
                    return Err(CacheError::RemoteOperation {
                        destination: destination.clone(),
                        source,
                    })
                }
            };

            match outcome {
                RemoteOutcome::Ok(value) => return Ok(value),
                RemoteOutcome::NotFound => {
                    if reconciled || resolution.was_uploaded(destination) {
                        return Err(CacheError::RemoteGone {
                            destination: destination.clone(),
                            remote_id: id,
                        });
                    }
                    self.report_not_found(&resolution.digest, destination, &id)
                        .await?;
                    reconciled = true;
                }
            }
        }
    }

    /// Digest and stat for a canonical path
    ///
    /// Uses the signature index when the file is unchanged; otherwise hashes
    /// and records a signature, but only if the file did not change while it
    /// was being read.
    async fn identify(&self, path: &Path) -> CacheResult<(FileDigest, FileStat)> {
        let mut stat = FileStat::read(path).await?;

        if let Some(cache) = &self.cache {
            match cache.signatures.lookup_stat(path, &stat) {
                Ok(Some(digest)) => return Ok((digest, stat)),
                Ok(None) => {}
                Err(e) => warn!("Signature lookup for {} failed: {}", path.display(), e),
            }
        }

        for _ in 0..MAX_HASH_ATTEMPTS {
            let digest = self.hasher.digest(path).await?;
            let after = FileStat::read(path).await?;
            if after == stat {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.signatures.record(path, &stat, &digest) {
                        warn!("Recording signature for {} failed: {}", path.display(), e);
                    }
                }
                return Ok((digest, stat));
            }
            debug!("{} changed while hashing, hashing again", path.display());
            stat = after;
        }

        Err(CacheError::FileUnstable(path.to_path_buf()))
    }

    /// Identifier for one destination, and whether it was uploaded just now
    async fn resolve_destination(
        &self,
        path: &Path,
        digest: &FileDigest,
        size_bytes: u64,
        destination: &DestinationKey,
    ) -> CacheResult<(RemoteId, bool)> {
        let Some(cache) = &self.cache else {
            return Ok((self.upload(path, destination).await?, true));
        };

        if let Some(id) = cached_id(cache, digest, destination)? {
            debug!(digest = %digest.short(), destination = %destination, "cache hit");
            return Ok((id, false));
        }

        let _guard = cache.locks.acquire(digest, destination).await?;
        if let Some(id) = cached_id(cache, digest, destination)? {
            debug!(
                digest = %digest.short(),
                destination = %destination,
                "uploaded by a concurrent caller"
            );
            return Ok((id, false));
        }

        let id = self.upload(path, destination).await?;
        let outcome = cache.store.put(digest, destination, &id, size_bytes)?;
        if !outcome.was_inserted() {
            warn!(
                "Discarding upload {} for {}: {} was already recorded",
                id,
                destination,
                outcome.remote_id()
            );
        }

        self.activity
            .log("upload.completed", || {
                serde_json::json!({
                    "path": path.display().to_string(),
                    "digest": digest.to_string(),
                    "destination": destination.as_str(),
                    "remote_id": outcome.remote_id().as_str(),
                    "size_bytes": size_bytes,
                })
            })
            .await;

        let fresh = outcome.was_inserted();
        Ok((outcome.into_remote_id(), fresh))
    }

    async fn upload(&self, path: &Path, destination: &DestinationKey) -> CacheResult<RemoteId> {
        info!("Uploading {} to {}", path.display(), destination);
        self.uploader
            .upload(path, destination)
            .await
            .map_err(|source| CacheError::RemoteUpload {
                destination: destination.clone(),
                source,
            })
    }
}

/// Stored identifier, touching the entry on a hit
///
/// The entry may disappear between the read and the touch if a retention
/// sweep runs concurrently; the identifier is still returned.
fn cached_id(
    cache: &CacheHandles,
    digest: &FileDigest,
    destination: &DestinationKey,
) -> CacheResult<Option<RemoteId>> {
    let Some(id) = cache.store.get(digest, destination)? else {
        return Ok(None);
    };
    if !cache.store.touch(digest)? {
        debug!(digest = %digest.short(), "entry vanished after hit");
    }
    Ok(Some(id))
}
