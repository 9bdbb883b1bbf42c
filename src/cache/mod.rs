//! Content-addressed upload cache
//!
//! Maps file content to the identifiers the remote service returned when
//! that content was uploaded, per destination, so identical bytes are never
//! uploaded twice to the same place.
//!
//! # Layout
//!
//! One SQLite database (`cache.db`) holds the digest-keyed entries and the
//! path-keyed signatures. Upload locks live next to it in `cache.locks/`;
//! a lock file only exists while its upload is in flight.
//!
//! # Entry Lifecycle
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | absent | live | first successful upload |
//! | live | live | new destination added, or a cache hit touches it |
//! | live | absent | retention sweep (expired) |
//! | live | absent | remote reported the identifier gone (invalidated) |
//!
//! Once absent, the next resolution is indistinguishable from a first upload.

pub mod db;
pub mod digest;
pub mod lock;
pub mod retention;
pub mod signature;
pub mod store;

pub use db::CacheDatabase;
pub use digest::{ContentHasher, FileDigest, HashAlgorithm};
pub use lock::{UploadLockGuard, UploadLocks};
pub use retention::{RetentionManager, RetentionPolicy, SweepReason, SweepReport};
pub use signature::{FileStat, PathSignature, PathSignatureIndex};
pub use store::{CacheEntry, CacheStore, PutOutcome, StoreStats};

use crate::config::schema::{CacheConfig, CorruptionPolicy};
use crate::error::{CacheError, CacheResult};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Everything that shares one cache database
#[derive(Debug, Clone)]
pub struct CacheHandles {
    pub store: CacheStore,
    pub signatures: PathSignatureIndex,
    pub locks: UploadLocks,
}

impl CacheHandles {
    /// Open the cache database at `path`, with locks beside it
    pub fn open(
        path: &Path,
        algorithm: HashAlgorithm,
        lock_timeout: Duration,
    ) -> CacheResult<Self> {
        let db = Arc::new(CacheDatabase::open(path)?);
        let locks = UploadLocks::new(path.with_extension("locks"), lock_timeout);
        Ok(Self::from_database(db, algorithm, locks))
    }

    pub fn from_database(
        db: Arc<CacheDatabase>,
        algorithm: HashAlgorithm,
        locks: UploadLocks,
    ) -> Self {
        Self {
            store: CacheStore::new(db.clone()),
            signatures: PathSignatureIndex::new(db, algorithm),
            locks,
        }
    }

    /// Open the cache the configuration asks for
    ///
    /// Returns `None` when caching is disabled, or when the database is
    /// corrupt and the configuration explicitly chose to bypass it.
    pub fn open_configured(config: &CacheConfig) -> CacheResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let path = config.database_path();
        match Self::open(&path, config.hash_algorithm, config.lock_timeout()) {
            Ok(handles) => Ok(Some(handles)),
            Err(CacheError::StoreCorruption { path, reason })
                if config.on_corruption == CorruptionPolicy::Bypass =>
            {
                warn!(
                    "Cache database {} is unreadable ({}); continuing without cache",
                    path.display(),
                    reason
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Retention manager over this cache
    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.store.clone())
            .with_signatures(self.signatures.clone())
            .with_locks(self.locks.clone())
    }
}
