//! Boundary with the remote AI service
//!
//! The cache only needs three things from the remote side: an upload that
//! returns an identifier, a way to tell transport failures apart from
//! "this identifier no longer exists", and the set of destinations a file
//! can be attached to. Everything else about the service's API lives
//! outside this crate.

pub mod directory;

pub use directory::DirectoryRemote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Opaque destination key as seen by the cache core
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationKey(String);

impl DestinationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Identifier the remote service handed back for an upload
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Destinations a file can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationKind {
    /// Code-execution sandbox
    ExecutionSandbox,
    /// Document-search index
    SearchIndex,
    /// Plain file input attached to a prompt
    UserData,
}

impl DestinationKind {
    /// Stable key used in the cache database
    pub fn key(&self) -> &'static str {
        match self {
            Self::ExecutionSandbox => "execution-sandbox",
            Self::SearchIndex => "search-index",
            Self::UserData => "user-data",
        }
    }

    /// All destination kinds
    pub fn all() -> &'static [Self] {
        &[Self::ExecutionSandbox, Self::SearchIndex, Self::UserData]
    }

    /// Map a cache key back to its destination kind
    pub fn from_key(key: &DestinationKey) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.key() == key.as_str())
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "execution-sandbox" | "exec" | "code-interpreter" => Ok(Self::ExecutionSandbox),
            "search-index" | "search" | "file-search" => Ok(Self::SearchIndex),
            "user-data" | "user" => Ok(Self::UserData),
            other => Err(format!(
                "unknown destination '{other}' \
                 (expected execution-sandbox, search-index or user-data)"
            )),
        }
    }
}

impl From<DestinationKind> for DestinationKey {
    fn from(kind: DestinationKind) -> Self {
        Self::new(kind.key())
    }
}

/// Errors reported by the remote collaborator
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("remote file not found: {0}")]
    NotFound(RemoteId),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Transport hiccups are worth retrying, everything else is not
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result of using a previously resolved identifier
///
/// `NotFound` is a signal, not a failure: the caller hands it back to the
/// coordinator, which forgets the identifier and uploads again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome<T> {
    Ok(T),
    NotFound,
}

/// Uploads a local file to one destination of the remote service
///
/// Implementations must not retry internally; failures are propagated
/// as-is and attributed to the destination by the coordinator.
#[async_trait]
pub trait RemoteUploader: Send + Sync {
    async fn upload(&self, path: &Path, destination: &DestinationKey)
        -> Result<RemoteId, RemoteError>;
}

#[async_trait]
impl<T: RemoteUploader + ?Sized> RemoteUploader for Arc<T> {
    async fn upload(
        &self,
        path: &Path,
        destination: &DestinationKey,
    ) -> Result<RemoteId, RemoteError> {
        (**self).upload(path, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_kind_keys_are_stable() {
        assert_eq!(DestinationKind::ExecutionSandbox.key(), "execution-sandbox");
        assert_eq!(DestinationKind::SearchIndex.to_string(), "search-index");
        assert_eq!(
            DestinationKey::from(DestinationKind::UserData).as_str(),
            "user-data"
        );
    }

    #[test]
    fn destination_kind_parses_aliases() {
        assert_eq!(
            "exec".parse::<DestinationKind>().unwrap(),
            DestinationKind::ExecutionSandbox
        );
        assert_eq!(
            "File-Search".parse::<DestinationKind>().unwrap(),
            DestinationKind::SearchIndex
        );
        assert!("ftp".parse::<DestinationKind>().is_err());
    }

    #[test]
    fn destination_kind_from_key() {
        let key = DestinationKey::new("search-index");
        assert_eq!(
            DestinationKind::from_key(&key),
            Some(DestinationKind::SearchIndex)
        );
        assert_eq!(DestinationKind::from_key(&DestinationKey::new("x")), None);
    }

    #[test]
    fn remote_error_classification() {
        assert!(RemoteError::NotFound(RemoteId::new("f1")).is_not_found());
        assert!(RemoteError::Transport("reset".into()).is_transient());
        assert!(!RemoteError::Rejected("too big".into()).is_transient());
    }
}
