//! Backup naming module for generating and parsing timestamp-based archive names
//!
//! Archive names look like `backup_<label>_<YYYYMMDD>_<HHMMSS>.zip`. The label
//! is derived from the source directory and may itself contain underscores,
//! so parsing always reads the timestamp from the end of the name.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::path::Path;

const PREFIX: &str = "backup_";
const EXTENSION: &str = ".zip";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Structured representation of an archive name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupName {
    /// Label identifying the backed up directory
    label: String,
    /// Creation time, truncated to whole seconds
    timestamp: DateTime<Utc>,
}

impl BackupName {
    /// Build a name for an archive of `label` created at `timestamp`
    pub fn generate(label: &str, timestamp: DateTime<Utc>) -> Self {
        let formatted = timestamp.format(TIMESTAMP_FORMAT).to_string();
        // Round-trip through the formatted string so the sub-second part is dropped
        let timestamp = NaiveDateTime::parse_from_str(&formatted, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or(timestamp);

        Self {
            label: sanitize_label(label),
            timestamp,
        }
    }

    /// Parse an archive file name back into its parts
    ///
    /// Returns `None` for anything that was not produced by [`BackupName::generate`].
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_prefix(PREFIX)?.strip_suffix(EXTENSION)?;

        let mut parts = stem.rsplitn(3, '_');
        let time_part = parts.next()?;
        let date_part = parts.next()?;
        let label = parts.next()?;

        if label.is_empty() || time_part.len() != 6 || date_part.len() != 8 {
            return None;
        }

        let timestamp =
            NaiveDateTime::parse_from_str(&format!("{}_{}", date_part, time_part), TIMESTAMP_FORMAT)
                .ok()?
                .and_utc();

        Some(Self {
            label: label.to_string(),
            timestamp,
        })
    }

    /// Get the label identifying the source directory
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Get the timestamp embedded in the name
    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}_{}{}",
            PREFIX,
            self.label,
            self.timestamp.format(TIMESTAMP_FORMAT),
            EXTENSION
        )
    }
}

/// Derive the archive label from the directory being backed up
pub fn label_for_source(source: &Path) -> String {
    source
        .file_name()
        .and_then(|name| name.to_str())
        .map(sanitize_label)
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| String::from("source"))
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_backup_name() {
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 5).unwrap();
        let name = BackupName::generate("photos", timestamp);

        assert_eq!(name.to_string(), "backup_photos_20250601_143005.zip");
    }

    #[test]
    fn test_generate_drops_subsecond_precision() {
        let timestamp = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 5).unwrap()
            + chrono::Duration::milliseconds(750);
        let name = BackupName::generate("photos", timestamp);

        assert_eq!(
            *name.timestamp(),
            Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 5).unwrap()
        );
    }

    #[test]
    fn test_parse_matches_generated_name() {
        let timestamp = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let generated = BackupName::generate("my_project", timestamp);

        let parsed = BackupName::parse(&generated.to_string()).unwrap();
        assert_eq!(parsed, generated);
        assert_eq!(parsed.label(), "my_project");
        assert_eq!(*parsed.timestamp(), timestamp);
    }

    #[test]
    fn test_parse_invalid_names() {
        // Wrong prefix
        assert!(BackupName::parse("archive_photos_20250601_143005.zip").is_none());

        // Wrong extension
        assert!(BackupName::parse("backup_photos_20250601_143005.tar").is_none());

        // Missing label
        assert!(BackupName::parse("backup_20250601_143005.zip").is_none());

        // Invalid date
        assert!(BackupName::parse("backup_photos_20251301_143005.zip").is_none());
    }

    #[test]
    fn test_label_for_source() {
        assert_eq!(label_for_source(Path::new("/home/user/Documents")), "Documents");
        assert_eq!(label_for_source(Path::new("/srv/data/")), "data");
        assert_eq!(label_for_source(Path::new("/srv/my files")), "my_files");
        assert_eq!(label_for_source(Path::new("/")), "source");
    }
}
