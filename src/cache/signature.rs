//! Path signature index
//!
//! Remembers `(size, mtime, digest)` per absolute path so that an unchanged
//! file does not have to be re-hashed. The index is pure acceleration: a
//! signature is only trusted when size and mtime still match what the
//! filesystem reports right now, and any row can be dropped at any time.
//!
//! A file rewritten within the filesystem's timestamp granularity, keeping
//! the same size, is not detected. This is a known limitation of the
//! size+mtime shortcut.

use super::db::CacheDatabase;
use super::digest::{FileDigest, HashAlgorithm};
use crate::error::{CacheError, CacheResult};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Size and modification time of a file, as reported by the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size_bytes: u64,
    /// Modification time in nanoseconds since the Unix epoch
    pub mtime_ns: i64,
}

impl FileStat {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> std::io::Result<Self> {
        let modified = metadata.modified()?;
        let mtime_ns = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
        };
        Ok(Self {
            size_bytes: metadata.len(),
            mtime_ns,
        })
    }

    /// Stat a path
    pub async fn read(path: &Path) -> CacheResult<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| CacheError::hash_failure(path, e))?;
        if !metadata.is_file() {
            return Err(CacheError::hash_failure(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        Self::from_metadata(&metadata).map_err(|e| CacheError::hash_failure(path, e))
    }
}

/// A stored signature row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSignature {
    pub path: PathBuf,
    pub stat: FileStat,
    pub digest: FileDigest,
}

/// Path → digest acceleration index
#[derive(Debug, Clone)]
pub struct PathSignatureIndex {
    db: Arc<CacheDatabase>,
    algorithm: HashAlgorithm,
}

impl PathSignatureIndex {
    pub fn new(db: Arc<CacheDatabase>, algorithm: HashAlgorithm) -> Self {
        Self { db, algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Digest for `path` if its stored signature still matches the file
    pub async fn lookup(&self, path: &Path) -> CacheResult<Option<FileDigest>> {
        let stat = match FileStat::read(path).await {
            Ok(stat) => stat,
            Err(_) => return Ok(None),
        };
        self.lookup_stat(path, &stat)
    }

    /// Like `lookup`, with a stat the caller already took
    ///
    /// A signature whose size or mtime differs, or that was recorded with a
    /// different hash algorithm, is discarded and `None` is returned.
    pub fn lookup_stat(&self, path: &Path, stat: &FileStat) -> CacheResult<Option<FileDigest>> {
        let Some(signature) = self.get(path)? else {
            return Ok(None);
        };

        if signature.stat == *stat && signature.digest.algorithm() == self.algorithm {
            debug!("Signature hit for {}", path.display());
            return Ok(Some(signature.digest));
        }

        debug!("Signature for {} is stale, discarding", path.display());
        self.forget(path)?;
        Ok(None)
    }

    /// Store or replace the signature for `path`
    pub fn record(&self, path: &Path, stat: &FileStat, digest: &FileDigest) -> CacheResult<()> {
        let key = path_key(path);
        let digest = digest.to_string();
        let now = Utc::now().timestamp_millis();
        self.db.write(|tx| {
            tx.execute(
                r#"
                INSERT INTO path_signatures (path, size_bytes, mtime_ns, digest, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(path) DO UPDATE SET
                    size_bytes = excluded.size_bytes,
                    mtime_ns = excluded.mtime_ns,
                    digest = excluded.digest,
                    recorded_at = excluded.recorded_at
                "#,
                params![key, stat.size_bytes as i64, stat.mtime_ns, digest, now],
            )?;
            Ok(())
        })
    }

    /// Raw stored signature, without checking the filesystem
    pub fn get(&self, path: &Path) -> CacheResult<Option<PathSignature>> {
        let key = path_key(path);
        let row = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT size_bytes, mtime_ns, digest FROM path_signatures WHERE path = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some((size, mtime_ns, digest)) = row else {
            return Ok(None);
        };
        match digest.parse::<FileDigest>() {
            Ok(digest) => Ok(Some(PathSignature {
                path: path.to_path_buf(),
                stat: FileStat {
                    size_bytes: size.max(0) as u64,
                    mtime_ns,
                },
                digest,
            })),
            Err(e) => {
                warn!("Dropping unreadable signature for {}: {}", path.display(), e);
                self.forget(path)?;
                Ok(None)
            }
        }
    }

    pub fn forget(&self, path: &Path) -> CacheResult<bool> {
        let key = path_key(path);
        let deleted = self.db.write(|tx| {
            Ok(tx.execute("DELETE FROM path_signatures WHERE path = ?1", params![key])?)
        })?;
        Ok(deleted > 0)
    }

    /// Drop signatures whose file no longer exists
    pub fn prune_missing(&self) -> CacheResult<usize> {
        let keys: Vec<Vec<u8>> = self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT path FROM path_signatures")?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
            Ok(keys)
        })?;

        let mut pruned = 0;
        for key in keys {
            let path = path_from_key(key);
            if !path.exists() && self.forget(&path)? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {} signatures for missing files", pruned);
        }
        Ok(pruned)
    }

    pub fn clear(&self) -> CacheResult<usize> {
        self.db
            .write(|tx| Ok(tx.execute("DELETE FROM path_signatures", [])?))
    }

    pub fn count(&self) -> CacheResult<u64> {
        self.db.read(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM path_signatures", [], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
    }
}

/// Raw OS bytes of `path`
///
/// Two paths that render the same lossily must still get distinct rows.
#[cfg(unix)]
fn path_key(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn path_from_key(key: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(key))
}

#[cfg(windows)]
fn path_key(path: &Path) -> Vec<u8> {
    use std::os::windows::ffi::OsStrExt;
    path.as_os_str()
        .encode_wide()
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(windows)]
fn path_from_key(key: Vec<u8>) -> PathBuf {
    use std::os::windows::ffi::OsStringExt;
    let wide: Vec<u16> = key
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    PathBuf::from(std::ffi::OsString::from_wide(&wide))
}
