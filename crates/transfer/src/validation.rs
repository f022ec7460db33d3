use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a folder-relative path does not escape its root.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Drive-letter paths written with forward slashes (`C:/…`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_upload_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() || file_path.starts_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    let bytes = file_path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(TransferError::InvalidPath(format!(
            "drive prefix not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Normalizes a folder-relative path for the wire.
///
/// Separators become `/`, `.` segments and duplicate slashes are dropped.
/// An empty input stays empty (flat upload); anything else must pass
/// [`validate_upload_path`].
pub fn normalize_relative_path(raw: &str) -> Result<String, TransferError> {
    if raw.is_empty() {
        return Ok(String::new());
    }

    let unified = raw.replace('\\', "/");
    validate_upload_path(&unified)?;

    let normalized = unified
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/");

    if normalized.is_empty() {
        return Err(TransferError::InvalidPath(format!(
            "path has no file component: {raw}"
        )));
    }
    Ok(normalized)
}
