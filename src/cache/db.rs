//! SQLite database shared by the cache store and the path signature index
//!
//! A single file holds both tables. The database runs in WAL mode so that
//! readers never wait on writers; writers take an `IMMEDIATE` transaction
//! and serialize at the engine level across processes.
//!
//! ## Schema
//!
//! - `meta`: key/value pairs, holds the schema version
//! - `entries`: one row per content digest, `remote_ids` is a JSON map of
//!   destination key to remote identifier
//! - `path_signatures`: one row per absolute path, keyed by the raw OS
//!   bytes of the path

use crate::error::{CacheError, CacheResult};
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i64 = 2;

/// How long a writer waits for another process's transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the on-disk cache database
pub struct CacheDatabase {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for CacheDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CacheDatabase {
    /// Open (creating if needed) the database at `path`
    ///
    /// Fails with `StoreCorruption` if the file exists but is not a readable
    /// SQLite database or fails its integrity check.
    pub fn open(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::io(format!("creating cache directory {}", parent.display()), e)
            })?;
        }

        let conn = Connection::open(path).map_err(|e| corruption_or(path, e))?;
        let db = Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        };
        db.initialize().map_err(|e| match e {
            CacheError::Database(inner) => corruption_or(path, inner),
            other => other,
        })?;

        debug!("Opened cache database at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> CacheResult<Self> {
        let db = Self {
            path: None,
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Location of the database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize(&self) -> CacheResult<()> {
        let conn = self.lock()?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode answers with the resulting mode, so it has to be queried
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Cache database journal mode: {}", mode);
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(CacheError::StoreCorruption {
                path: self.path.clone().unwrap_or_default(),
                reason: check,
            });
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|v| v.parse().unwrap_or(0));

        if let Some(found) = found {
            if found > SCHEMA_VERSION {
                return Err(CacheError::SchemaTooNew {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
            if found < 2 {
                // version 1 keyed signatures by lossy UTF-8 text
                info!("Rebuilding path signature index with byte-exact keys");
                conn.execute_batch("DROP TABLE IF EXISTS path_signatures;")?;
            }
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                digest TEXT PRIMARY KEY,
                remote_ids TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_created
                ON entries(created_at);
            CREATE INDEX IF NOT EXISTS idx_entries_accessed
                ON entries(last_accessed_at);

            CREATE TABLE IF NOT EXISTS path_signatures (
                path BLOB PRIMARY KEY,
                size_bytes INTEGER NOT NULL,
                mtime_ns INTEGER NOT NULL,
                digest TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            );
            "#,
        )?;

        if found != Some(SCHEMA_VERSION) {
            if let Some(found) = found {
                info!(
                    "Upgrading cache schema from version {} to {}",
                    found, SCHEMA_VERSION
                );
            }
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }

        Ok(())
    }

    /// Run a read against the committed state
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> CacheResult<T>) -> CacheResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run a mutation inside an `IMMEDIATE` transaction
    ///
    /// Either everything `f` wrote is committed and synced, or nothing is.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> CacheResult<T>,
    ) -> CacheResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Internal("Cache database lock poisoned".to_string()))
    }
}

fn corruption_or(path: &Path, err: rusqlite::Error) -> CacheError {
    match err.sqlite_error_code() {
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt) => CacheError::StoreCorruption {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
        _ => CacheError::Database(err),
    }
}
