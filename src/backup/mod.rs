//! Backup lifecycle: naming, archiving, remote storage and the orchestrator
//! that ties them to the audit log.

pub mod archive;
pub mod naming;
pub mod orchestrator;
pub mod storage;

/// Error type shared by every backup collaborator
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::Store(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BackupError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        BackupError::Store(format!("migration failed: {}", error))
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(error: reqwest::Error) -> Self {
        BackupError::Transfer(error.to_string())
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(error: zip::result::ZipError) -> Self {
        BackupError::Compression(error.to_string())
    }
}

impl From<walkdir::Error> for BackupError {
    fn from(error: walkdir::Error) -> Self {
        BackupError::Compression(error.to_string())
    }
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;
