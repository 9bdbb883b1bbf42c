//! Error types for attach-cache
//!
//! All modules use `CacheResult<T>` as their return type.

use crate::remote::{DestinationKey, RemoteError, RemoteId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// A failure attributed to one destination of a resolution call
#[derive(Debug)]
pub struct DestinationFailure {
    /// Destination that failed
    pub destination: DestinationKey,
    /// What went wrong for it
    pub error: CacheError,
}

/// All errors that can occur in attach-cache
#[derive(Error, Debug)]
pub enum CacheError {
    // Hashing errors
    #[error("Cannot read {path} for hashing: {source}")]
    HashFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File {0} kept changing while it was being hashed")]
    FileUnstable(PathBuf),

    // Concurrency errors
    #[error("Timed out after {waited:?} waiting for upload lock on {digest} ({destination})")]
    LockTimeout {
        digest: String,
        destination: DestinationKey,
        waited: Duration,
    },

    // Remote errors
    #[error("Upload to {destination} failed: {source}")]
    RemoteUpload {
        destination: DestinationKey,
        #[source]
        source: RemoteError,
    },

    #[error("Remote operation on {destination} failed: {source}")]
    RemoteOperation {
        destination: DestinationKey,
        #[source]
        source: RemoteError,
    },

    #[error("Remote file {remote_id} on {destination} vanished again right after re-upload")]
    RemoteGone {
        destination: DestinationKey,
        remote_id: RemoteId,
    },

    #[error("{} destination(s) failed: {}", failures.len(), describe_failures(failures))]
    PartialResolution {
        resolved: BTreeMap<DestinationKey, RemoteId>,
        failures: Vec<DestinationFailure>,
    },

    // Storage errors
    #[error("Cache database at {path} is unreadable: {reason}")]
    StoreCorruption { path: PathBuf, reason: String },

    #[error("Cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cache database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

fn describe_failures(failures: &[DestinationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.destination, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a hash failure for a path
    pub fn hash_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::HashFailure {
            path: path.into(),
            source,
        }
    }

    /// Check if error is retryable
    ///
    /// A partial resolution is retryable only when every failed destination is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::FileUnstable(_) => true,
            Self::RemoteUpload { source, .. } | Self::RemoteOperation { source, .. } => {
                source.is_transient()
            }
            Self::PartialResolution { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_retryable())
            }
            Self::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => {
                Some("Another process is uploading the same file; retry shortly")
            }
            Self::StoreCorruption { .. } => Some(
                "Run: attach-cache cache clear --yes, or set cache.on_corruption = \"bypass\"",
            ),
            Self::SchemaTooNew { .. } => {
                Some("Upgrade attach-cache or point cache.path at a different database")
            }
            Self::RemoteUpload { source, .. } if source.is_auth() => {
                Some("Check the credentials configured for the remote service")
            }
            _ => None,
        }
    }

    /// Destination this error is attributed to, if any
    pub fn destination(&self) -> Option<&DestinationKey> {
        match self {
            Self::LockTimeout { destination, .. }
            | Self::RemoteUpload { destination, .. }
            | Self::RemoteOperation { destination, .. }
            | Self::RemoteGone { destination, .. } => Some(destination),
            _ => None,
        }
    }
}
