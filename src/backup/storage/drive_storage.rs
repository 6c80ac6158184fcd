//! Google Drive implementation of the StorageClient trait
//!
//! Talks to the Drive v3 REST API directly: folders are looked up with a
//! files.list query and created with files.create, archives are sent
//! through a resumable upload session.

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::backup::archive::ArchiveArtifact;
use crate::backup::{BackupError, Result};

use super::{FolderHandle, Session, StorageClient, UploadReceipt};

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const ZIP_MIME_TYPE: &str = "application/zip";

/// Provides Google Drive storage for backup archives
pub struct DriveStorageClient {
    http: Client,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFileMetadata<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<&'a str>,
}

impl DriveStorageClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn find_folder(&self, session: &Session, name: &str) -> Result<Option<FolderHandle>> {
        let query = folder_query(name);
        debug!("Searching Drive with query: {}", query);

        let resp = self
            .http
            .get(FILES_URL)
            .bearer_auth(&session.access_token)
            .query(&[("q", query.as_str()), ("fields", "files(id,name)"), ("pageSize", "1")])
            .send()
            .await?;
        let list: DriveFileList = check_response(resp, "folder lookup").await?.json().await?;

        Ok(first_folder(list))
    }

    async fn create_folder(&self, session: &Session, name: &str) -> Result<FolderHandle> {
        let metadata = NewFileMetadata {
            name,
            mime_type: Some(FOLDER_MIME_TYPE),
            parents: Vec::new(),
        };

        let resp = self
            .http
            .post(FILES_URL)
            .bearer_auth(&session.access_token)
            .query(&[("fields", "id,name")])
            .json(&metadata)
            .send()
            .await?;
        let created: DriveFile = check_response(resp, "folder creation").await?.json().await?;

        info!("Created Drive folder {} ({})", created.name, created.id);
        Ok(FolderHandle {
            id: created.id,
            name: created.name,
        })
    }
}

#[async_trait]
impl StorageClient for DriveStorageClient {
    async fn resolve_folder(&self, session: &Session, name: &str) -> Result<FolderHandle> {
        match self.find_folder(session, name).await? {
            Some(folder) => {
                debug!("Found Drive folder {} ({})", folder.name, folder.id);
                Ok(folder)
            }
            None => self.create_folder(session, name).await,
        }
    }

    async fn upload(
        &self,
        session: &Session,
        folder: &FolderHandle,
        artifact: &ArchiveArtifact,
    ) -> Result<UploadReceipt> {
        let (body, length) = archive_body(&artifact.path).await?;

        let metadata = NewFileMetadata {
            name: &artifact.name,
            mime_type: None,
            parents: vec![folder.id.as_str()],
        };

        debug!(
            "Opening upload session for {} ({} bytes) in folder {}",
            artifact.name, length, folder.id
        );
        let resp = self
            .http
            .post(UPLOAD_URL)
            .bearer_auth(&session.access_token)
            .query(&[("uploadType", "resumable")])
            .header("X-Upload-Content-Type", ZIP_MIME_TYPE)
            .header("X-Upload-Content-Length", length)
            .json(&metadata)
            .send()
            .await?;
        let resp = check_response(resp, "upload session").await?;

        let session_url = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| {
                BackupError::Transfer("upload session response had no Location header".to_string())
            })?;

        let resp = self
            .http
            .put(&session_url)
            .header(CONTENT_TYPE, ZIP_MIME_TYPE)
            // Streamed bodies carry no length of their own
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        let uploaded: DriveFile = check_response(resp, "upload").await?.json().await?;

        info!("Uploaded {} to Drive as {}", uploaded.name, uploaded.id);
        Ok(UploadReceipt {
            remote_id: uploaded.id,
            name: uploaded.name,
        })
    }

    fn backend_name(&self) -> &'static str {
        "Google Drive"
    }
}

/// Open an archive as a streamed request body, returning it with its size
async fn archive_body(path: &Path) -> Result<(Body, u64)> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        BackupError::Transfer(format!("failed to open {}: {}", path.display(), e))
    })?;
    let length = file.metadata().await?.len();
    Ok((Body::wrap_stream(ReaderStream::new(file)), length))
}

/// Build the files.list query matching a non-trashed folder called `name`
fn folder_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        "name='{}' and mimeType='{}' and trashed=false",
        escaped, FOLDER_MIME_TYPE
    )
}

fn first_folder(list: DriveFileList) -> Option<FolderHandle> {
    list.files.into_iter().next().map(|file| FolderHandle {
        id: file.id,
        name: file.name,
    })
}

/// Turn a non-2xx response into an error carrying the status and body
async fn check_response(resp: Response, operation: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    error!("Drive {} failed with {}: {}", operation, status, body);

    if status == StatusCode::UNAUTHORIZED {
        Err(BackupError::Auth(format!("Drive rejected the access token during {}: {}", operation, body)))
    } else {
        Err(BackupError::Transfer(format!("Drive {} failed with {}: {}", operation, status, body)))
    }
}
