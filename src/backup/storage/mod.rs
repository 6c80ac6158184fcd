//! Storage module for uploading archives to their remote destination
//!
//! This module provides the capability interfaces the orchestrator depends
//! on, so that Google Drive, a local folder, or an in-memory fake can be
//! swapped in without touching the backup lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::GoogleAuthProvider;
use crate::backup::archive::ArchiveArtifact;
use crate::backup::Result;
use crate::config::{BackupConfig, StorageBackend};

pub mod drive_storage;
pub mod local_storage;

/// An authenticated session with the storage backend
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Bearer token sent with every request
    pub access_token: String,
    /// When the token stops being accepted, if known
    pub expires_at: Option<DateTime<Utc>>,
}

/// Identifier of the destination folder in the storage backend
#[derive(Debug, Clone, PartialEq)]
pub struct FolderHandle {
    pub id: String,
    pub name: String,
}

/// Confirmation returned by a completed upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    /// Identifier of the uploaded file in the backend
    pub remote_id: String,
    /// Name the file was stored under
    pub name: String,
}

/// Produces sessions usable by a [`StorageClient`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Obtain a usable session, refreshing stored credentials if needed
    async fn obtain_session(&self) -> Result<Session>;
}

/// Provides the remote storage operations needed by a backup run
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Find the folder called `name`, creating it if it does not exist
    async fn resolve_folder(&self, session: &Session, name: &str) -> Result<FolderHandle>;

    /// Upload an archive into `folder`
    async fn upload(
        &self,
        session: &Session,
        folder: &FolderHandle,
        artifact: &ArchiveArtifact,
    ) -> Result<UploadReceipt>;

    /// Human readable name of the backend, used in log lines and record messages
    fn backend_name(&self) -> &'static str;
}

/// Session provider for backends that need no credentials
#[derive(Debug, Default, Clone)]
pub struct StaticSessionProvider;

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn obtain_session(&self) -> Result<Session> {
        Ok(Session {
            access_token: String::new(),
            expires_at: None,
        })
    }
}

/// Session provider and storage client pair for the configured backend
pub struct StorageStack {
    pub sessions: Arc<dyn SessionProvider>,
    pub storage: Arc<dyn StorageClient>,
    /// Google auth handle when the backend needs interactive authorization
    pub google_auth: Option<Arc<GoogleAuthProvider>>,
}

/// Create the session provider and storage client for the current configuration
pub fn create_storage_stack(config: &BackupConfig, http: reqwest::Client) -> Result<StorageStack> {
    match config.storage_backend {
        StorageBackend::Drive => {
            let auth = Arc::new(GoogleAuthProvider::new(
                http.clone(),
                config.client_secrets_file.clone(),
                config.credentials_file.clone(),
            ));
            Ok(StorageStack {
                sessions: auth.clone(),
                storage: Arc::new(drive_storage::DriveStorageClient::new(http)),
                google_auth: Some(auth),
            })
        }
        StorageBackend::Local => {
            config.ensure_local_storage_dir()?;
            Ok(StorageStack {
                sessions: Arc::new(StaticSessionProvider),
                storage: Arc::new(local_storage::LocalFolderStorage::new(config)),
                google_auth: None,
            })
        }
    }
}
