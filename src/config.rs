use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;

use crate::backup::{BackupError, Result};

/// Where uploaded archives end up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Google Drive through the Drive v3 API
    Drive,
    /// A directory on the local filesystem
    Local,
}

impl FromStr for StorageBackend {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "drive" | "google" | "gdrive" => Ok(StorageBackend::Drive),
            "local" => Ok(StorageBackend::Local),
            other => Err(BackupError::Config(format!(
                "STORAGE_BACKEND must be 'drive' or 'local', got '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the backup job, loaded once at startup
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory that gets compressed and uploaded
    pub source_directory: PathBuf,
    /// Name of the destination folder in the storage backend
    pub drive_folder_name: String,
    /// Minimum number of days between successful backups
    pub interval_days: i64,
    /// Bypass the interval check and tick on `check_interval`
    pub development_mode: bool,
    /// OAuth token file, written after the first authorization
    pub credentials_file: PathBuf,
    /// Google OAuth client secrets downloaded from the cloud console
    pub client_secrets_file: PathBuf,
    /// Daily wall-clock time at which the due check runs
    pub backup_time: NaiveTime,
    /// Overrides `backup_time`, for trying out the schedule
    pub test_backup_time: Option<NaiveTime>,
    /// Check cadence in development mode
    pub check_interval: Duration,
    /// SQLite URL of the backup log
    pub database_url: String,
    /// Text log mirrored from the console
    pub log_file: PathBuf,
    /// Directory where archives are written before upload
    pub work_dir: PathBuf,
    /// Keep the local archive when its upload fails
    pub keep_failed_archives: bool,
    /// Write a `skipped` row for ticks where no backup was due
    pub persist_skips: bool,
    /// Destination backend for archives
    pub storage_backend: StorageBackend,
    /// Root directory for the local storage backend
    pub local_storage_dir: PathBuf,
    /// Per-request timeout for storage and auth calls
    pub upload_timeout: Duration,
}

/// Upper bound for `BACKUP_INTERVAL_DAYS` (a century)
pub const MAX_INTERVAL_DAYS: i64 = 36_500;

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_directory: PathBuf::new(),
            drive_folder_name: String::from("Backup"),
            interval_days: 3,
            development_mode: false,
            credentials_file: PathBuf::from("mycreds.json"),
            client_secrets_file: PathBuf::from("client_secrets.json"),
            backup_time: NaiveTime::from_hms_opt(13, 0, 0).unwrap_or(NaiveTime::MIN),
            test_backup_time: None,
            check_interval: Duration::from_secs(60),
            database_url: String::from("sqlite:backups.db"),
            log_file: PathBuf::from("backup.log"),
            work_dir: PathBuf::from("."),
            keep_failed_archives: false,
            persist_skips: false,
            storage_backend: StorageBackend::Drive,
            local_storage_dir: PathBuf::from("./drive"),
            upload_timeout: Duration::from_secs(1800),
        }
    }
}

impl BackupConfig {
    /// Load backup configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load backup configuration from an arbitrary key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        // Blank values count as unset, as they do in most .env files
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let source_directory = get("SOURCE_DIRECTORY")
            .map(PathBuf::from)
            .ok_or_else(|| BackupError::Config("SOURCE_DIRECTORY must be set".to_string()))?;

        let interval_days = match get("BACKUP_INTERVAL_DAYS") {
            Some(v) => parse_number::<i64>("BACKUP_INTERVAL_DAYS", &v)?,
            None => defaults.interval_days,
        };
        if !(0..=MAX_INTERVAL_DAYS).contains(&interval_days) {
            return Err(BackupError::Config(format!(
                "BACKUP_INTERVAL_DAYS must be between 0 and {}, got {}",
                MAX_INTERVAL_DAYS, interval_days
            )));
        }

        let check_interval = match get("CHECK_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(parse_number::<u64>("CHECK_INTERVAL_SECS", &v)?.max(1)),
            None => defaults.check_interval,
        };

        let upload_timeout = match get("UPLOAD_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_number::<u64>("UPLOAD_TIMEOUT_SECS", &v)?),
            None => defaults.upload_timeout,
        };

        let backup_time = match get("BACKUP_TIME") {
            Some(v) => parse_time("BACKUP_TIME", &v)?,
            None => defaults.backup_time,
        };

        let test_backup_time = get("TEST_BACKUP_TIME")
            .map(|v| parse_time("TEST_BACKUP_TIME", &v))
            .transpose()?;

        let storage_backend = get("STORAGE_BACKEND")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(defaults.storage_backend);

        Ok(Self {
            source_directory,
            drive_folder_name: get("DRIVE_FOLDER_NAME").unwrap_or(defaults.drive_folder_name),
            interval_days,
            development_mode: get("DEVELOPMENT_MODE").map(|v| parse_bool(&v)).unwrap_or(false),
            credentials_file: get("GOOGLE_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials_file),
            client_secrets_file: get("GOOGLE_CLIENT_SECRETS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.client_secrets_file),
            backup_time,
            test_backup_time,
            check_interval,
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            log_file: get("LOG_FILE").map(PathBuf::from).unwrap_or(defaults.log_file),
            work_dir: get("BACKUP_WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            keep_failed_archives: get("KEEP_FAILED_ARCHIVES").map(|v| parse_bool(&v)).unwrap_or(false),
            persist_skips: get("PERSIST_SKIPS").map(|v| parse_bool(&v)).unwrap_or(false),
            storage_backend,
            local_storage_dir: get("LOCAL_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_storage_dir),
            upload_timeout,
        })
    }

    /// Check the filesystem preconditions that make the configuration usable
    pub fn validate(&self) -> Result<()> {
        if !self.source_directory.is_dir() {
            return Err(BackupError::Config(format!(
                "SOURCE_DIRECTORY is not a directory: {}",
                self.source_directory.display()
            )));
        }

        if self.storage_backend == StorageBackend::Drive && !self.client_secrets_file.is_file() {
            return Err(BackupError::Config(format!(
                "Google client secrets file not found: {}",
                self.client_secrets_file.display()
            )));
        }

        if self.drive_folder_name.is_empty() {
            return Err(BackupError::Config("DRIVE_FOLDER_NAME must not be empty".to_string()));
        }

        Ok(())
    }

    /// Time of day at which the scheduler fires outside development mode
    pub fn effective_backup_time(&self) -> NaiveTime {
        self.test_backup_time.unwrap_or(self.backup_time)
    }

    /// Ensure the local storage directory exists
    pub fn ensure_local_storage_dir(&self) -> Result<()> {
        ensure_dir(&self.local_storage_dir)
    }

    /// Ensure the archive working directory exists
    pub fn ensure_work_dir(&self) -> Result<()> {
        ensure_dir(&self.work_dir)
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| {
            BackupError::Config(format!("Failed to create directory {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BackupError::Config(format!("{} must be a whole number, got '{}'", key, value)))
}

fn parse_time(key: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| BackupError::Config(format!("{} must look like HH:MM, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = BackupConfig::from_lookup(lookup_from(&[("SOURCE_DIRECTORY", "/data")])).unwrap();

        assert_eq!(config.source_directory, PathBuf::from("/data"));
        assert_eq!(config.drive_folder_name, "Backup");
        assert_eq!(config.interval_days, 3);
        assert!(!config.development_mode);
        assert_eq!(config.backup_time, NaiveTime::from_hms_opt(13, 0, 0).unwrap());
        assert_eq!(config.test_backup_time, None);
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.storage_backend, StorageBackend::Drive);
        assert!(!config.keep_failed_archives);
        assert!(!config.persist_skips);
    }

    #[test]
    fn test_all_values_read() {
        let config = BackupConfig::from_lookup(lookup_from(&[
            ("SOURCE_DIRECTORY", "/data/photos"),
            ("DRIVE_FOLDER_NAME", "Photos"),
            ("BACKUP_INTERVAL_DAYS", "7"),
            ("DEVELOPMENT_MODE", "True"),
            ("GOOGLE_CREDENTIALS_FILE", "/etc/backup/token.json"),
            ("GOOGLE_CLIENT_SECRETS_FILE", "/etc/backup/secrets.json"),
            ("BACKUP_TIME", "02:30"),
            ("TEST_BACKUP_TIME", "18:45:10"),
            ("CHECK_INTERVAL_SECS", "15"),
            ("DATABASE_URL", "sqlite:/var/lib/backup/log.db"),
            ("KEEP_FAILED_ARCHIVES", "yes"),
            ("PERSIST_SKIPS", "1"),
            ("STORAGE_BACKEND", "local"),
            ("LOCAL_STORAGE_DIR", "/mnt/backup"),
            ("UPLOAD_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.drive_folder_name, "Photos");
        assert_eq!(config.interval_days, 7);
        assert!(config.development_mode);
        assert_eq!(config.credentials_file, PathBuf::from("/etc/backup/token.json"));
        assert_eq!(config.client_secrets_file, PathBuf::from("/etc/backup/secrets.json"));
        assert_eq!(config.backup_time, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        assert_eq!(
            config.effective_backup_time(),
            NaiveTime::from_hms_opt(18, 45, 10).unwrap()
        );
        assert_eq!(config.check_interval, Duration::from_secs(15));
        assert_eq!(config.database_url, "sqlite:/var/lib/backup/log.db");
        assert!(config.keep_failed_archives);
        assert!(config.persist_skips);
        assert_eq!(config.storage_backend, StorageBackend::Local);
        assert_eq!(config.local_storage_dir, PathBuf::from("/mnt/backup"));
        assert_eq!(config.upload_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_interval_bounds_accepted() {
        for days in ["0", "36500"] {
            let config = BackupConfig::from_lookup(lookup_from(&[
                ("SOURCE_DIRECTORY", "/data"),
                ("BACKUP_INTERVAL_DAYS", days),
            ]))
            .unwrap();
            assert_eq!(config.interval_days.to_string(), days);
        }
    }

    #[test]
    fn test_missing_source_directory() {
        let result = BackupConfig::from_lookup(lookup_from(&[("SOURCE_DIRECTORY", "  ")]));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_interval = BackupConfig::from_lookup(lookup_from(&[
            ("SOURCE_DIRECTORY", "/data"),
            ("BACKUP_INTERVAL_DAYS", "three"),
        ]));
        assert!(matches!(bad_interval, Err(BackupError::Config(_))));

        let negative_interval = BackupConfig::from_lookup(lookup_from(&[
            ("SOURCE_DIRECTORY", "/data"),
            ("BACKUP_INTERVAL_DAYS", "-1"),
        ]));
        assert!(matches!(negative_interval, Err(BackupError::Config(_))));

        let huge_interval = BackupConfig::from_lookup(lookup_from(&[
            ("SOURCE_DIRECTORY", "/data"),
            ("BACKUP_INTERVAL_DAYS", "1000000000"),
        ]));
        assert!(matches!(huge_interval, Err(BackupError::Config(_))));

        let bad_time = BackupConfig::from_lookup(lookup_from(&[
            ("SOURCE_DIRECTORY", "/data"),
            ("TEST_BACKUP_TIME", "25:00"),
        ]));
        assert!(matches!(bad_time, Err(BackupError::Config(_))));

        let bad_backend = BackupConfig::from_lookup(lookup_from(&[
            ("SOURCE_DIRECTORY", "/data"),
            ("STORAGE_BACKEND", "s3"),
        ]));
        assert!(matches!(bad_backend, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_validate() {
        let temp_dir = tempdir().unwrap();
        let secrets = temp_dir.path().join("client_secrets.json");
        std::fs::write(&secrets, "{}").unwrap();

        let mut config = BackupConfig {
            source_directory: temp_dir.path().to_path_buf(),
            client_secrets_file: secrets,
            ..BackupConfig::default()
        };
        assert!(config.validate().is_ok());

        config.client_secrets_file = temp_dir.path().join("missing.json");
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));

        // The local backend needs no Google secrets
        config.storage_backend = StorageBackend::Local;
        assert!(config.validate().is_ok());

        config.source_directory = temp_dir.path().join("missing");
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));
    }
}
