//! ZIP archive creation for the backed up directory
//!
//! The archive is written to a hidden temporary file next to its final
//! location and only renamed into place once the ZIP central directory has
//! been written, so a failed compression never leaves a partial archive.

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::backup::{BackupError, Result};

/// A compressed archive waiting to be uploaded
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveArtifact {
    /// File name of the archive (also the record's backup name)
    pub name: String,
    /// Location of the archive on the local filesystem
    pub path: PathBuf,
    /// Size of the archive in bytes
    pub size_bytes: u64,
}

/// Turns a directory into a single compressed file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveWriter: Send + Sync {
    /// Compress `source` into a new archive at `destination`
    ///
    /// On error no file is left at `destination`.
    async fn compress(&self, source: &Path, destination: &Path) -> Result<ArchiveArtifact>;
}

/// Archive writer producing DEFLATE-compressed ZIP files
#[derive(Debug, Default, Clone)]
pub struct ZipArchiveWriter;

impl ZipArchiveWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveWriter for ZipArchiveWriter {
    async fn compress(&self, source: &Path, destination: &Path) -> Result<ArchiveArtifact> {
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();

        tokio::task::spawn_blocking(move || write_zip(&source, &destination))
            .await
            .map_err(|e| BackupError::Compression(format!("compression task failed: {}", e)))?
    }
}

fn write_zip(source: &Path, destination: &Path) -> Result<ArchiveArtifact> {
    if !source.is_dir() {
        return Err(BackupError::Compression(format!(
            "source is not a readable directory: {}",
            source.display()
        )));
    }

    let name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            BackupError::Compression(format!("invalid archive path: {}", destination.display()))
        })?
        .to_string();
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    info!("Compressing {} into {}", source.display(), destination.display());

    // Dropped (and deleted) on every early return below
    let staging = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".zip")
        .tempfile_in(&parent)?;

    let file = staging.reopen()?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut file_count = 0usize;
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            BackupError::Compression(format!("failed to read {}: {}", source.display(), e))
        })?;
        let path = entry.path();

        if path == destination || path == staging.path() {
            continue;
        }

        let relative = path.strip_prefix(source).map_err(|e| {
            BackupError::Compression(format!("failed to relativize {}: {}", path.display(), e))
        })?;
        let Some(entry_name) = archive_entry_name(relative) else {
            // The root directory itself
            continue;
        };

        if entry.file_type().is_dir() {
            zip.add_directory(entry_name, options)?;
        } else if entry.file_type().is_file() {
            let mut input = File::open(path).map_err(|e| {
                BackupError::Compression(format!("failed to open {}: {}", path.display(), e))
            })?;
            zip.start_file(entry_name, options)?;
            io::copy(&mut input, &mut zip).map_err(|e| {
                BackupError::Compression(format!("failed to compress {}: {}", path.display(), e))
            })?;
            file_count += 1;
        } else {
            debug!("Skipping non-regular file {}", path.display());
        }
    }

    zip.finish()?;

    staging.persist(destination).map_err(|e| {
        BackupError::Compression(format!(
            "failed to move archive into {}: {}",
            destination.display(),
            e.error
        ))
    })?;

    let size_bytes = std::fs::metadata(destination)?.len();
    info!("Compressed {} files into {} ({} bytes)", file_count, name, size_bytes);

    Ok(ArchiveArtifact {
        name,
        path: destination.to_path_buf(),
        size_bytes,
    })
}

/// Build a `/`-separated entry name, or `None` for the archive root
fn archive_entry_name(relative: &Path) -> Option<String> {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn create_source_tree(root: &Path) {
        std::fs::create_dir_all(root.join("notes/archive")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("readme.txt"), "top level").unwrap();
        std::fs::write(root.join("notes/today.md"), "# Today").unwrap();
        std::fs::write(root.join("notes/archive/old.md"), "# Old").unwrap();
    }

    #[tokio::test]
    async fn test_compress_directory() {
        let temp_dir = tempdir().unwrap();
        let source = temp_dir.path().join("source");
        create_source_tree(&source);
        let destination = temp_dir.path().join("out").join("backup_source_20250601_143005.zip");

        let artifact = ZipArchiveWriter::new()
            .compress(&source, &destination)
            .await
            .unwrap();

        assert_eq!(artifact.name, "backup_source_20250601_143005.zip");
        assert_eq!(artifact.path, destination);
        assert!(artifact.size_bytes > 0);

        let mut archive = zip::ZipArchive::new(File::open(&destination).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "empty/",
                "notes/",
                "notes/archive/",
                "notes/archive/old.md",
                "notes/today.md",
                "readme.txt",
            ]
        );

        let mut content = String::new();
        archive
            .by_name("notes/archive/old.md")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "# Old");
    }

    #[tokio::test]
    async fn test_compress_skips_archive_inside_source() {
        let temp_dir = tempdir().unwrap();
        let source = temp_dir.path().join("source");
        create_source_tree(&source);
        let destination = source.join("backup_source_20250601_143005.zip");

        ZipArchiveWriter::new()
            .compress(&source, &destination)
            .await
            .unwrap();

        let archive = zip::ZipArchive::new(File::open(&destination).unwrap()).unwrap();
        assert!(archive.file_names().all(|n| !n.ends_with(".zip")));
    }

    #[tokio::test]
    async fn test_missing_source_leaves_no_file() {
        let temp_dir = tempdir().unwrap();
        let destination = temp_dir.path().join("backup_missing_20250601_143005.zip");

        let result = ZipArchiveWriter::new()
            .compress(&temp_dir.path().join("missing"), &destination)
            .await;

        assert!(matches!(result, Err(BackupError::Compression(_))));
        assert!(!destination.exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_archive_entry_name() {
        assert_eq!(archive_entry_name(Path::new("")), None);
        assert_eq!(archive_entry_name(Path::new("a.txt")), Some("a.txt".to_string()));
        assert_eq!(
            archive_entry_name(Path::new("nested/dir/a.txt")),
            Some("nested/dir/a.txt".to_string())
        );
    }
}
