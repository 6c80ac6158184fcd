//! Backup orchestration
//!
//! This module decides whether a backup is due and drives a single run
//! through compression, upload and logging. Every eligible run ends with
//! exactly one `success` or `failure` row in the backup log, and errors from
//! collaborators never escape [`BackupOrchestrator::evaluate_and_run`].

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::backup::archive::{ArchiveArtifact, ArchiveWriter};
use crate::backup::naming::{label_for_source, BackupName};
use crate::backup::storage::{FolderHandle, Session, SessionProvider, StorageClient, UploadReceipt};
use crate::backup::{BackupError, Result};
use crate::config::BackupConfig;
use crate::db::{BackupRecord, BackupStatus, BackupStore};

const COMPRESSED_MESSAGE: &str = "Archive compressed successfully.";

/// Everything a backup run needs, passed in explicitly
#[derive(Clone)]
pub struct BackupContext {
    pub config: Arc<BackupConfig>,
    pub store: Arc<dyn BackupStore>,
    pub archiver: Arc<dyn ArchiveWriter>,
    pub sessions: Arc<dyn SessionProvider>,
    pub storage: Arc<dyn StorageClient>,
}

/// Result of the due check
#[derive(Debug, Clone, PartialEq)]
pub enum Eligibility {
    /// A backup should run now
    Due {
        last_success: Option<DateTime<Utc>>,
    },
    /// The interval since the last success has not elapsed yet
    NotDue {
        last_success: DateTime<Utc>,
        next_due: DateTime<Utc>,
    },
}

/// How a single invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Not due; nothing was archived
    Skipped {
        last_success: DateTime<Utc>,
        next_due: DateTime<Utc>,
    },
    /// Archive uploaded and recorded
    Succeeded(BackupRecord),
    /// Compression, authentication or upload failed and was recorded
    Failed(BackupRecord),
    /// The backup log could not be read, so nothing was attempted
    CheckFailed { reason: String },
}

/// Drives the archive → upload → log lifecycle
pub struct BackupOrchestrator {
    ctx: BackupContext,
    /// Destination folder, cached until an upload into it fails
    folder: Mutex<Option<FolderHandle>>,
    /// Mutex to ensure only one backup runs at a time
    run_mutex: Mutex<()>,
}

impl BackupOrchestrator {
    /// Create a new orchestrator around the given collaborators
    pub fn new(ctx: BackupContext) -> Self {
        Self {
            ctx,
            folder: Mutex::new(None),
            run_mutex: Mutex::new(()),
        }
    }

    /// Run one scheduler tick against the current time
    pub async fn evaluate_and_run(&self) -> RunOutcome {
        self.run_at(Utc::now()).await
    }

    /// Run one scheduler tick as if the current time were `now`
    pub async fn run_at(&self, now: DateTime<Utc>) -> RunOutcome {
        let _lock = self.run_mutex.lock().await;

        info!("Checking whether a backup is due");
        let eligibility = match self.is_backup_due(now).await {
            Ok(eligibility) => eligibility,
            Err(e) => {
                // Without the log the interval cannot be enforced; wait for the next tick
                error!("Could not read the last successful backup, skipping this tick: {}", e);
                return RunOutcome::CheckFailed {
                    reason: error_message(&e),
                };
            }
        };

        match eligibility {
            Eligibility::NotDue {
                last_success,
                next_due,
            } => {
                info!(
                    "Backup not due: last success at {}, next backup due at {}",
                    last_success, next_due
                );
                if self.ctx.config.persist_skips {
                    let record = BackupRecord::new(
                        now,
                        "",
                        BackupStatus::Skipped,
                        format!("Not due until {}", next_due),
                    );
                    self.record(&record).await;
                }
                RunOutcome::Skipped {
                    last_success,
                    next_due,
                }
            }
            Eligibility::Due { last_success } => {
                match last_success {
                    Some(at) => info!("Backup due (last success at {})", at),
                    None => info!("Backup due (no successful backup recorded yet)"),
                }
                self.perform_backup(now).await
            }
        }
    }

    /// Decide whether a backup is due at `now`
    ///
    /// Read-only: calling it repeatedly without a new success in between
    /// always gives the same answer.
    pub async fn is_backup_due(&self, now: DateTime<Utc>) -> Result<Eligibility> {
        let last_success = self.ctx.store.latest_success().await?;
        Ok(decide(
            last_success,
            now,
            self.ctx.config.interval_days,
            self.ctx.config.development_mode,
        ))
    }

    /// Compress, upload and record a backup taken at `now`
    async fn perform_backup(&self, now: DateTime<Utc>) -> RunOutcome {
        let config = &self.ctx.config;
        let name = BackupName::generate(&label_for_source(&config.source_directory), now).to_string();
        let archive_path = config.work_dir.join(&name);

        info!("Starting backup of directory: {}", config.source_directory.display());
        let artifact = match self.ctx.archiver.compress(&config.source_directory, &archive_path).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!("Compression failed: {}", e);
                remove_archive(&archive_path).await;
                return self.fail(now, &name, error_message(&e)).await;
            }
        };

        match self.upload(&artifact).await {
            Ok(receipt) => {
                let upload_message = format!(
                    "Archive uploaded to {} as {} ({}).",
                    self.ctx.storage.backend_name(),
                    receipt.name,
                    receipt.remote_id
                );
                info!("Backup completed and uploaded: {}", artifact.name);

                let record = BackupRecord::new(
                    now,
                    &artifact.name,
                    BackupStatus::Success,
                    format!("{} | {}", COMPRESSED_MESSAGE, upload_message),
                );
                let record = self.record(&record).await;

                // The durable copy now lives remotely
                if remove_archive(&artifact.path).await {
                    info!("Local archive {} removed after upload", artifact.name);
                }

                RunOutcome::Succeeded(record)
            }
            Err(e) => {
                error!("Archive compressed but upload failed: {}", e);
                if config.keep_failed_archives {
                    info!("Keeping {} for inspection", artifact.path.display());
                } else {
                    remove_archive(&artifact.path).await;
                }
                self.fail(now, &artifact.name, format!("{} | {}", COMPRESSED_MESSAGE, error_message(&e)))
                    .await
            }
        }
    }

    /// Authenticate, resolve the destination folder and upload
    async fn upload(&self, artifact: &ArchiveArtifact) -> Result<UploadReceipt> {
        let session = self.ctx.sessions.obtain_session().await?;
        if let Some(expires_at) = session.expires_at {
            debug!("Session valid until {}", expires_at);
        }
        let folder = self.resolve_folder(&session).await?;

        info!(
            "Uploading {} ({} bytes) to {} folder '{}'",
            artifact.name,
            artifact.size_bytes,
            self.ctx.storage.backend_name(),
            folder.name
        );
        let result = self.ctx.storage.upload(&session, &folder, artifact).await;
        if result.is_err() {
            // The folder may have been deleted remotely; look it up again next run
            *self.folder.lock().await = None;
            debug!("Cleared cached folder {} after failed upload", folder.id);
        }
        result
    }

    /// Resolve the destination folder, caching it for later runs
    async fn resolve_folder(&self, session: &Session) -> Result<FolderHandle> {
        let mut cached = self.folder.lock().await;
        if let Some(folder) = cached.as_ref() {
            return Ok(folder.clone());
        }

        let folder = self
            .ctx
            .storage
            .resolve_folder(session, &self.ctx.config.drive_folder_name)
            .await?;
        *cached = Some(folder.clone());
        Ok(folder)
    }

    async fn fail(&self, now: DateTime<Utc>, name: &str, message: String) -> RunOutcome {
        let record = BackupRecord::new(now, name, BackupStatus::Failure, message);
        RunOutcome::Failed(self.record(&record).await)
    }

    /// Append a record to the store; a store failure is logged, never raised
    async fn record(&self, record: &BackupRecord) -> BackupRecord {
        let mut stored = record.clone();
        match self.ctx.store.insert(record).await {
            Ok(id) => stored.id = Some(id),
            Err(e) => error!(
                "Failed to record {} for '{}' in the backup log: {} (message: {})",
                record.status, record.backup_name, e, record.message
            ),
        }
        stored
    }
}

/// Pure due-check: due if never backed up, in development mode, or once
/// `interval_days` whole days have passed since the last success
pub fn decide(
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval_days: i64,
    development_mode: bool,
) -> Eligibility {
    match last_success {
        None => Eligibility::Due { last_success: None },
        Some(last) if development_mode => Eligibility::Due {
            last_success: Some(last),
        },
        Some(last) => {
            // Out-of-range intervals push the next backup to the end of time
            let next_due = Duration::try_days(interval_days)
                .and_then(|interval| last.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now >= next_due {
                Eligibility::Due {
                    last_success: Some(last),
                }
            } else {
                Eligibility::NotDue {
                    last_success: last,
                    next_due,
                }
            }
        }
    }
}

fn error_message(error: &BackupError) -> String {
    match error {
        BackupError::Compression(msg)
        | BackupError::Transfer(msg)
        | BackupError::Auth(msg)
        | BackupError::Config(msg)
        | BackupError::Store(msg) => msg.clone(),
        BackupError::Io(e) => e.to_string(),
    }
}

/// Delete a local archive if present, returning whether a file was removed
async fn remove_archive(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            error!("Failed to delete local archive {}: {}", path.display(), e);
            false
        }
    }
}
