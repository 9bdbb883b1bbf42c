//! Per-(digest, destination) upload locks
//!
//! Each pair gets its own lock file under the locks directory, held with an
//! exclusive advisory lock for the duration of one upload. Unrelated pairs
//! never contend. The OS releases the lock if the holder dies, so a crashed
//! upload cannot wedge later callers.
//!
//! On Unix the holder unlinks the file before unlocking, so the directory
//! only contains locks that are currently held (or were held by a process
//! that crashed). A waiter that wins the lock on an unlinked file notices the
//! path no longer names its inode and starts over with a fresh open.

use super::digest::FileDigest;
use crate::error::{CacheError, CacheResult};
use crate::remote::DestinationKey;
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default bound on how long to wait for a contended lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Factory for upload locks rooted at one directory
#[derive(Debug, Clone)]
pub struct UploadLocks {
    dir: PathBuf,
    timeout: Duration,
}

/// Held upload lock, released on drop
#[derive(Debug)]
pub struct UploadLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for UploadLockGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                debug!("Could not unlink upload lock {}: {}", self.path.display(), e);
            }
        }
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release upload lock {}: {}", self.path.display(), e);
        }
    }
}

impl UploadLocks {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the lock for `(digest, destination)`
    ///
    /// Polls until the lock is free or the timeout elapses, in which case
    /// `LockTimeout` is returned and the caller may retry later.
    pub async fn acquire(
        &self,
        digest: &FileDigest,
        destination: &DestinationKey,
    ) -> CacheResult<UploadLockGuard> {
        let path = self.lock_path(digest, destination);
        let started = Instant::now();
        loop {
            let file = self.open(&path)?;
            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => break,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => {
                        return Err(CacheError::io(format!("locking {}", path.display()), e));
                    }
                }
                self.wait(started, digest, destination).await?;
            }

            if still_linked(&file, &path) {
                debug!(
                    digest = %digest.short(),
                    destination = %destination,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "upload lock acquired"
                );
                return Ok(UploadLockGuard { file, path });
            }
            debug!("Upload lock {} was unlinked by its last holder, reopening", path.display());
            self.wait(started, digest, destination).await?;
        }
    }

    fn open(&self, path: &Path) -> CacheResult<File> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CacheError::io(format!("creating lock directory {}", self.dir.display()), e)
        })?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::io(format!("opening lock {}", path.display()), e))
    }

    /// Sleep one poll interval, or fail once the timeout has elapsed
    async fn wait(
        &self,
        started: Instant,
        digest: &FileDigest,
        destination: &DestinationKey,
    ) -> CacheResult<()> {
        let waited = started.elapsed();
        if waited >= self.timeout {
            return Err(CacheError::LockTimeout {
                digest: digest.to_string(),
                destination: destination.clone(),
                waited,
            });
        }
        tokio::time::sleep(POLL_INTERVAL.min(self.timeout - waited)).await;
        Ok(())
    }

    /// Unlink lock files nobody holds
    ///
    /// Only leftovers from crashed holders normally exist. Each file is
    /// locked before it is removed, so a live upload is never affected.
    #[cfg(unix)]
    pub fn prune_idle(&self) -> CacheResult<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CacheError::io(
                    format!("listing lock directory {}", self.dir.display()),
                    e,
                ))
            }
        };

        let mut pruned = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("lock") {
                continue;
            }
            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            if file.try_lock_exclusive().is_ok()
                && still_linked(&file, &path)
                && std::fs::remove_file(&path).is_ok()
            {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Removed {} idle upload lock file(s)", pruned);
        }
        Ok(pruned)
    }

    /// Without unlink-on-release the files are reused, not pruned
    #[cfg(not(unix))]
    pub fn prune_idle(&self) -> CacheResult<usize> {
        Ok(0)
    }

    fn lock_path(&self, digest: &FileDigest, destination: &DestinationKey) -> PathBuf {
        let dest: String = destination
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!(
            "{}-{}.{}.lock",
            digest.algorithm(),
            digest.to_hex(),
            dest
        ))
    }
}

/// Whether `path` still names the inode behind `file`
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

/// Lock files are never unlinked here, so the open handle is always current
#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> bool {
    true
}
