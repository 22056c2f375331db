//! Workspace path containment.
//!
//! Lexical checks alone miss symlinks and symlink checks alone miss
//! `..`; `safe_join` applies both before a path is trusted.

use std::path::{Component, Path, PathBuf};

use path_clean::PathClean;

use crate::error::{StoreError, StoreResult};

/// Join `relative` onto `root` without ever leaving `root`.
///
/// Rejects absolute inputs and any `..` component, before and after
/// lexical normalization. Every existing segment of the joined path is
/// then probed: a segment that is a symbolic link must resolve inside
/// the canonical root. Returns the lexically resolved absolute path,
/// which may not exist yet.
pub fn safe_join(root: &Path, relative: &str) -> StoreResult<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(StoreError::PathTraversal(relative.to_string()));
    }
    if has_parent_component(rel) {
        return Err(StoreError::PathTraversal(relative.to_string()));
    }

    let cleaned = rel.clean();
    if cleaned.is_absolute() || has_parent_component(&cleaned) {
        return Err(StoreError::PathTraversal(relative.to_string()));
    }

    let root_real = root.canonicalize()?;
    if cleaned == Path::new(".") {
        return Ok(root_real);
    }

    let mut probe = root_real.clone();
    for component in cleaned.components() {
        let Component::Normal(segment) = component else {
            continue;
        };
        probe.push(segment);
        let meta = match std::fs::symlink_metadata(&probe) {
            Ok(meta) => meta,
            // First missing segment: nothing beyond it exists to check.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
            Err(err) => return Err(err.into()),
        };
        if meta.file_type().is_symlink() {
            let target = probe.canonicalize()?;
            if !target.starts_with(&root_real) {
                return Err(StoreError::SymlinkEscape(relative.to_string()));
            }
        }
    }

    Ok(root_real.join(cleaned))
}

fn has_parent_component(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}
