//! Folder scanning for imports.
//!
//! Walks a directory tree and sorts its regular files into those that can be
//! uploaded and those that cannot, with folder-relative paths normalized to
//! forward slashes.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::UploadError;

/// A file found under an imported folder.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path below the scanned root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
}

/// Why a file under an imported folder is left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    TooLarge { limit: u64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Empty => f.write_str("file is empty"),
            SkipReason::TooLarge { limit } => write!(f, "file exceeds the {limit} byte limit"),
        }
    }
}

/// A file the scan left out.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
    pub relative_path: String,
    pub size: u64,
    pub reason: SkipReason,
}

/// Result of scanning a folder.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FolderScan {
    /// Uploadable files, sorted by relative path.
    pub files: Vec<ScannedFile>,
    /// Files left out, sorted by relative path.
    pub skipped: Vec<SkippedFile>,
    /// Total size of `files` in bytes.
    pub total_size: u64,
}

/// Scans `root` and everything below it.
///
/// Empty files and files larger than `max_file_size` go to
/// [`FolderScan::skipped`]. Symlinks and other special files are ignored.
pub fn scan_folder(root: &Path, max_file_size: u64) -> Result<FolderScan, UploadError> {
    let mut scan = FolderScan::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let size = entry.metadata()?.len();
            let relative_path = path
                .strip_prefix(root)
                .map_err(std::io::Error::other)?
                .to_string_lossy()
                .replace('\\', "/");

            let reason = if size == 0 {
                Some(SkipReason::Empty)
            } else if size > max_file_size {
                Some(SkipReason::TooLarge {
                    limit: max_file_size,
                })
            } else {
                None
            };

            match reason {
                Some(reason) => scan.skipped.push(SkippedFile {
                    relative_path,
                    size,
                    reason,
                }),
                None => {
                    scan.total_size += size;
                    scan.files.push(ScannedFile {
                        path,
                        relative_path,
                        size,
                    });
                }
            }
        }
    }

    scan.files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    scan.skipped.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(scan)
}
