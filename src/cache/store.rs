//! Content-addressed store of remote identifiers
//!
//! Maps a content digest to the identifiers that content received on each
//! destination it was uploaded to. An identifier, once written, is never
//! replaced in place: it is used as-is, or removed and later re-inserted by
//! a fresh upload.

use super::db::CacheDatabase;
use super::digest::FileDigest;
use crate::error::{CacheError, CacheResult};
use crate::remote::{DestinationKey, RemoteId};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Rows fetched per page by `list_expirable`
const PAGE_SIZE: usize = 256;

/// One cached piece of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    /// Content digest, the entry's identity
    pub digest: FileDigest,
    /// Remote identifier per destination
    pub remote_ids: BTreeMap<DestinationKey, RemoteId>,
    /// Size of the content when first uploaded
    pub size_bytes: u64,
    /// When the first upload was recorded
    pub created_at: DateTime<Utc>,
    /// Last cache hit or upload
    pub last_accessed_at: DateTime<Utc>,
}

/// What `put` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The identifier was stored
    Inserted(RemoteId),
    /// An identifier already existed and was kept
    Existing(RemoteId),
}

impl PutOutcome {
    /// The identifier that is now authoritative
    pub fn remote_id(&self) -> &RemoteId {
        match self {
            Self::Inserted(id) | Self::Existing(id) => id,
        }
    }

    pub fn into_remote_id(self) -> RemoteId {
        match self {
            Self::Inserted(id) | Self::Existing(id) => id,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Aggregate numbers for `cache stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: u64,
    pub destinations: u64,
    pub total_bytes: u64,
}

/// Durable digest → identifiers store
#[derive(Debug, Clone)]
pub struct CacheStore {
    db: Arc<CacheDatabase>,
}

impl CacheStore {
    pub fn new(db: Arc<CacheDatabase>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<CacheDatabase> {
        &self.db
    }

    /// Identifier stored for `(digest, destination)`, if any
    pub fn get(
        &self,
        digest: &FileDigest,
        destination: &DestinationKey,
    ) -> CacheResult<Option<RemoteId>> {
        let key = digest.to_string();
        self.db.read(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT remote_ids FROM entries WHERE digest = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match json {
                Some(json) => Ok(parse_remote_ids(&json)?.remove(destination)),
                None => Ok(None),
            }
        })
    }

    /// Record an identifier for `(digest, destination)`
    ///
    /// Never overwrites: if an identifier already exists it is returned as
    /// `Existing` and `remote_id` is discarded. A losing upload contender
    /// therefore cannot clobber the winner's identifier.
    pub fn put(
        &self,
        digest: &FileDigest,
        destination: &DestinationKey,
        remote_id: &RemoteId,
        size_bytes: u64,
    ) -> CacheResult<PutOutcome> {
        let key = digest.to_string();
        let now = Utc::now().timestamp_millis();

        let outcome = self.db.write(|tx| {
            match load_remote_ids(tx, &key)? {
                None => {
                    let mut ids = BTreeMap::new();
                    ids.insert(destination.clone(), remote_id.clone());
                    tx.execute(
                        r#"
                        INSERT INTO entries
                            (digest, remote_ids, size_bytes, created_at, last_accessed_at)
                        VALUES (?1, ?2, ?3, ?4, ?4)
                        "#,
                        params![key, serde_json::to_string(&ids)?, size_bytes as i64, now],
                    )?;
                    Ok(PutOutcome::Inserted(remote_id.clone()))
                }
                Some(mut ids) => {
                    if let Some(existing) = ids.get(destination) {
                        return Ok(PutOutcome::Existing(existing.clone()));
                    }
                    ids.insert(destination.clone(), remote_id.clone());
                    tx.execute(
                        r#"
                        UPDATE entries
                        SET remote_ids = ?2, last_accessed_at = MAX(last_accessed_at, ?3)
                        WHERE digest = ?1
                        "#,
                        params![key, serde_json::to_string(&ids)?, now],
                    )?;
                    Ok(PutOutcome::Inserted(remote_id.clone()))
                }
            }
        })?;

        debug!(
            digest = %digest.short(),
            destination = %destination,
            inserted = outcome.was_inserted(),
            "put {}",
            outcome.remote_id()
        );
        Ok(outcome)
    }

    /// Forget the identifier for one destination
    ///
    /// Other destinations of the same digest are left alone. An entry left
    /// with no destinations is deleted. Returns whether anything was removed.
    pub fn invalidate(
        &self,
        digest: &FileDigest,
        destination: &DestinationKey,
    ) -> CacheResult<bool> {
        self.remove_destination(digest, destination, None)
    }

    /// Like `invalidate`, but only if the stored identifier is still `expected`
    ///
    /// Used by reconciliation so a stale report cannot remove an identifier
    /// that another process has already replaced.
    pub fn invalidate_if(
        &self,
        digest: &FileDigest,
        destination: &DestinationKey,
        expected: &RemoteId,
    ) -> CacheResult<bool> {
        self.remove_destination(digest, destination, Some(expected))
    }

    fn remove_destination(
        &self,
        digest: &FileDigest,
        destination: &DestinationKey,
        expected: Option<&RemoteId>,
    ) -> CacheResult<bool> {
        let key = digest.to_string();
        let removed = self.db.write(|tx| {
            let Some(mut ids) = load_remote_ids(tx, &key)? else {
                return Ok(false);
            };
            match (ids.get(destination), expected) {
                (None, _) => return Ok(false),
                (Some(current), Some(expected)) if current != expected => return Ok(false),
                _ => {}
            }
            ids.remove(destination);

            if ids.is_empty() {
                tx.execute("DELETE FROM entries WHERE digest = ?1", params![key])?;
            } else {
                tx.execute(
                    "UPDATE entries SET remote_ids = ?2 WHERE digest = ?1",
                    params![key, serde_json::to_string(&ids)?],
                )?;
            }
            Ok(true)
        })?;

        if removed {
            debug!(digest = %digest.short(), destination = %destination, "invalidated");
        }
        Ok(removed)
    }

    /// Mark an entry as used now
    ///
    /// `last_accessed_at` never moves backwards. Returns false if the entry
    /// no longer exists (for example, a retention sweep removed it).
    pub fn touch(&self, digest: &FileDigest) -> CacheResult<bool> {
        self.touch_at(digest, Utc::now())
    }

    pub(crate) fn touch_at(&self, digest: &FileDigest, now: DateTime<Utc>) -> CacheResult<bool> {
        let key = digest.to_string();
        let updated = self.db.write(|tx| {
            Ok(tx.execute(
                "UPDATE entries SET last_accessed_at = MAX(last_accessed_at, ?2) WHERE digest = ?1",
                params![key, now.timestamp_millis()],
            )?)
        })?;
        Ok(updated > 0)
    }

    /// Full entry for a digest
    pub fn entry(&self, digest: &FileDigest) -> CacheResult<Option<CacheEntry>> {
        let key = digest.to_string();
        let row = self.db.read(|conn| {
            Ok(conn
                .query_row(
                    &format!("{SELECT_ENTRY} WHERE digest = ?1"),
                    params![key],
                    EntryRow::from_row,
                )
                .optional()?)
        })?;
        row.map(EntryRow::into_entry).transpose()
    }

    /// Entries created before `older_than`, fetched lazily page by page
    ///
    /// The sequence is finite and can be restarted by calling this again.
    /// Rows deleted while iterating do not disturb it.
    pub fn list_expirable(&self, older_than: DateTime<Utc>) -> ExpirableEntries<'_> {
        ExpirableEntries {
            store: self,
            cutoff_ms: older_than.timestamp_millis(),
            cursor: String::new(),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// All entries, most recently used first
    pub fn list(&self) -> CacheResult<Vec<CacheEntry>> {
        let rows = self.db.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_ENTRY} ORDER BY last_accessed_at DESC"))?;
            let rows = stmt
                .query_map([], EntryRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    /// Digest, size and last access of every entry, least recently used first
    pub fn lru_order(&self) -> CacheResult<Vec<(FileDigest, u64, DateTime<Utc>)>> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT digest, size_bytes, last_accessed_at FROM entries
                ORDER BY last_accessed_at ASC, digest ASC
                "#,
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(digest, size, accessed)| {
                Ok((digest.parse()?, size.max(0) as u64, from_millis(accessed)?))
            })
            .collect()
    }

    /// Delete an entry with all its destinations
    pub fn delete(&self, digest: &FileDigest) -> CacheResult<bool> {
        let key = digest.to_string();
        let deleted = self.db.write(|tx| {
            Ok(tx.execute("DELETE FROM entries WHERE digest = ?1", params![key])?)
        })?;
        Ok(deleted > 0)
    }

    /// Delete an entry only if it was created before `cutoff`
    ///
    /// Guards against removing an entry that was deleted and recreated
    /// between a retention scan and the delete.
    pub fn delete_if_created_before(
        &self,
        digest: &FileDigest,
        cutoff: DateTime<Utc>,
    ) -> CacheResult<bool> {
        let key = digest.to_string();
        let deleted = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM entries WHERE digest = ?1 AND created_at < ?2",
                params![key, cutoff.timestamp_millis()],
            )?)
        })?;
        Ok(deleted > 0)
    }

    /// Delete an entry only if nobody has used it since `seen`
    pub fn delete_if_idle_since(
        &self,
        digest: &FileDigest,
        seen: DateTime<Utc>,
    ) -> CacheResult<bool> {
        let key = digest.to_string();
        let deleted = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM entries WHERE digest = ?1 AND last_accessed_at <= ?2",
                params![key, seen.timestamp_millis()],
            )?)
        })?;
        Ok(deleted > 0)
    }

    /// Delete every entry, returning how many were removed
    pub fn clear(&self) -> CacheResult<usize> {
        self.db
            .write(|tx| Ok(tx.execute("DELETE FROM entries", [])?))
    }

    pub fn stats(&self) -> CacheResult<StoreStats> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT remote_ids, size_bytes FROM entries")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut stats = StoreStats::default();
        for (json, size) in rows {
            stats.entries += 1;
            stats.destinations += parse_remote_ids(&json)?.len() as u64;
            stats.total_bytes += size.max(0) as u64;
        }
        Ok(stats)
    }

    #[cfg(test)]
    pub(crate) fn set_timestamps(
        &self,
        digest: &FileDigest,
        created_at: DateTime<Utc>,
        last_accessed_at: DateTime<Utc>,
    ) -> CacheResult<()> {
        let key = digest.to_string();
        self.db.write(|tx| {
            tx.execute(
                "UPDATE entries SET created_at = ?2, last_accessed_at = ?3 WHERE digest = ?1",
                params![
                    key,
                    created_at.timestamp_millis(),
                    last_accessed_at.timestamp_millis()
                ],
            )?;
            Ok(())
        })
    }

    fn fetch_page(&self, cutoff_ms: i64, after: &str) -> CacheResult<Vec<CacheEntry>> {
        let rows = self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_ENTRY} WHERE created_at < ?1 AND digest > ?2 ORDER BY digest ASC LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(
                    params![cutoff_ms, after, PAGE_SIZE as i64],
                    EntryRow::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(EntryRow::into_entry).collect()
    }
}

/// Lazy iterator returned by [`CacheStore::list_expirable`]
pub struct ExpirableEntries<'a> {
    store: &'a CacheStore,
    cutoff_ms: i64,
    cursor: String,
    page: VecDeque<CacheEntry>,
    exhausted: bool,
}

impl Iterator for ExpirableEntries<'_> {
    type Item = CacheResult<CacheEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.store.fetch_page(self.cutoff_ms, &self.cursor) {
                Ok(entries) => {
                    if entries.len() < PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if let Some(last) = entries.last() {
                        self.cursor = last.digest.to_string();
                    }
                    self.page.extend(entries);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

const SELECT_ENTRY: &str =
    "SELECT digest, remote_ids, size_bytes, created_at, last_accessed_at FROM entries";

struct EntryRow {
    digest: String,
    remote_ids: String,
    size_bytes: i64,
    created_at: i64,
    last_accessed_at: i64,
}

impl EntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            digest: row.get(0)?,
            remote_ids: row.get(1)?,
            size_bytes: row.get(2)?,
            created_at: row.get(3)?,
            last_accessed_at: row.get(4)?,
        })
    }

    fn into_entry(self) -> CacheResult<CacheEntry> {
        Ok(CacheEntry {
            digest: self.digest.parse()?,
            remote_ids: parse_remote_ids(&self.remote_ids)?,
            size_bytes: self.size_bytes.max(0) as u64,
            created_at: from_millis(self.created_at)?,
            last_accessed_at: from_millis(self.last_accessed_at)?,
        })
    }
}

fn load_remote_ids(
    tx: &Transaction<'_>,
    key: &str,
) -> CacheResult<Option<BTreeMap<DestinationKey, RemoteId>>> {
    let json: Option<String> = tx
        .query_row(
            "SELECT remote_ids FROM entries WHERE digest = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|j| parse_remote_ids(&j)).transpose()
}

fn parse_remote_ids(json: &str) -> CacheResult<BTreeMap<DestinationKey, RemoteId>> {
    Ok(serde_json::from_str(json)?)
}

fn from_millis(ms: i64) -> CacheResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CacheError::Internal(format!("timestamp out of range: {ms}")))
}
