//! Crash-safe file primitives underneath the store.
//!
//! A record file is replaced by writing a sibling temp file and renaming
//! it over the destination; a log file is committed one newline-delimited
//! JSON value at a time. The tail reader tolerates exactly one torn
//! write: bytes after the last newline are uncommitted and dropped.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{StoreError, StoreResult};

/// Atomically replace `path` with the JSON serialization of `value`.
///
/// Parent directories are created as needed. The destination is either
/// its prior contents or the new fully-formed record, never partial.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    // NamedTempFile is created mode 0600 and removes itself unless
    // persisted.
    let mut tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|err| StoreError::Internal(err.to_string()))?;

    // Flushing the directory makes the rename itself durable. Failure
    // here does not un-commit the record.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Append `value` as one newline-terminated JSON line to `path`.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let existed = path.exists();
    let mut line = serde_json::to_string(value)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !existed {
        set_file_private(path)?;
    }
    file.write_all(line.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read every committed record of a line-delimited JSON file in order.
///
/// A trailing fragment without a final newline is a crash-interrupted
/// append and is silently discarded. Any committed line that fails to
/// parse fails the whole read with `INVALID_LINE`.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let committed = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(last_newline) => &bytes[..=last_newline],
        None => return Ok(Vec::new()),
    };

    let mut records = Vec::new();
    for (idx, line) in committed.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_slice(line).map_err(|_| StoreError::InvalidLine {
            file: path.display().to_string(),
            line: idx + 1,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Restrict a directory to its owner (0700).
pub fn set_dir_private(path: &Path) -> StoreResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Restrict a file to its owner (0600).
pub fn set_file_private(path: &Path) -> StoreResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
