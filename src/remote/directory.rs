//! Filesystem-backed remote
//!
//! Stores "uploaded" files under `<root>/<destination>/<file-id>`. Used by
//! the CLI when no service client is wired in, and by tests that need to
//! delete remote files out of band.

use super::{DestinationKey, RemoteError, RemoteId, RemoteUploader};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Remote that copies files into a local directory tree
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check whether an identifier still exists on the remote
    pub async fn exists(&self, destination: &DestinationKey, id: &RemoteId) -> bool {
        fs::try_exists(self.object_path(destination, id))
            .await
            .unwrap_or(false)
    }

    /// Delete an identifier, as the service would when expiring a file
    pub async fn delete(
        &self,
        destination: &DestinationKey,
        id: &RemoteId,
    ) -> Result<(), RemoteError> {
        let path = self.object_path(destination, id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RemoteError::NotFound(id.clone()))
            }
            Err(e) => Err(RemoteError::io(format!("deleting {}", path.display()), e)),
        }
    }

    fn object_path(&self, destination: &DestinationKey, id: &RemoteId) -> PathBuf {
        self.root.join(destination.as_str()).join(id.as_str())
    }
}

#[async_trait]
impl RemoteUploader for DirectoryRemote {
    async fn upload(
        &self,
        path: &Path,
        destination: &DestinationKey,
    ) -> Result<RemoteId, RemoteError> {
        let dir = self.root.join(destination.as_str());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| RemoteError::io(format!("creating {}", dir.display()), e))?;

        let id = RemoteId::new(format!("file-{}", Uuid::new_v4().simple()));
        let target = dir.join(id.as_str());
        let bytes = fs::copy(path, &target)
            .await
            .map_err(|e| RemoteError::io(format!("copying {}", path.display()), e))?;

        debug!("Uploaded {} ({} bytes) to {} as {}", path.display(), bytes, destination, id);
        Ok(id)
    }
}
