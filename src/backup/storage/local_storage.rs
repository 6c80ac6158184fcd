//! Local filesystem implementation of the StorageClient trait
//!
//! Mirrors the Drive layout on disk (one subdirectory per remote folder) for
//! development runs where no Google credentials are available.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tracing::{debug, info};

use crate::backup::archive::ArchiveArtifact;
use crate::backup::{BackupError, Result};
use crate::config::BackupConfig;

use super::{FolderHandle, Session, StorageClient, UploadReceipt};

/// Stores archives in a directory on the local filesystem
pub struct LocalFolderStorage {
    /// Base directory standing in for the Drive root
    root_dir: PathBuf,
}

impl LocalFolderStorage {
    /// Create a new LocalFolderStorage with the given configuration
    pub fn new(config: &BackupConfig) -> Self {
        Self::with_root(&config.local_storage_dir)
    }

    pub fn with_root(root_dir: &Path) -> Self {
        Self {
            root_dir: root_dir.to_path_buf(),
        }
    }

    fn folder_path(&self, folder: &FolderHandle) -> PathBuf {
        self.root_dir.join(&folder.id)
    }
}

#[async_trait]
impl StorageClient for LocalFolderStorage {
    async fn resolve_folder(&self, _session: &Session, name: &str) -> Result<FolderHandle> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(BackupError::Transfer(format!("invalid folder name: {:?}", name)));
        }

        let handle = FolderHandle {
            id: name.to_string(),
            name: name.to_string(),
        };
        let path = self.folder_path(&handle);

        if !path.exists() {
            debug!("Creating local folder {}", path.display());
            tokio_fs::create_dir_all(&path)
                .await
                .map_err(|e| BackupError::Transfer(format!("failed to create {}: {}", path.display(), e)))?;
        }

        Ok(handle)
    }

    async fn upload(
        &self,
        _session: &Session,
        folder: &FolderHandle,
        artifact: &ArchiveArtifact,
    ) -> Result<UploadReceipt> {
        let dest_path = self.folder_path(folder).join(&artifact.name);

        tokio_fs::copy(&artifact.path, &dest_path)
            .await
            .map_err(|e| BackupError::Transfer(format!("failed to copy to {}: {}", dest_path.display(), e)))?;

        info!("Copied {} to {}", artifact.name, dest_path.display());
        Ok(UploadReceipt {
            remote_id: dest_path.display().to_string(),
            name: artifact.name.clone(),
        })
    }

    fn backend_name(&self) -> &'static str {
        "local folder"
    }
}
