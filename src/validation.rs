//! Path confinement for kernel file transfers.
//!
//! Container paths are resolved lexically against the in-container home
//! directory; host paths are additionally resolved through existing
//! symlinks before the containment check. Both reject escapes with
//! `Error::PermissionDenied` before any I/O happens.

use std::path::{Component, Path, PathBuf};

use crate::types::{Error, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Lexically normalize a POSIX path, resolving `.` and `..`.
///
/// `..` at the filesystem root stays at the root, matching `normpath`.
fn normalize_posix(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolve `path` against the confined in-container `root`.
///
/// Relative paths are joined to `root`; absolute paths are taken as-is.
/// Returns the normalized absolute path, or a permission error when it
/// would land outside `root`.
pub fn confine_container_path(root: &str, path: &str) -> Result<String> {
    let root = normalize_posix(root);
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", root, path)
    };
    let resolved = normalize_posix(&joined);
    let inside = resolved == root || resolved.starts_with(&format!("{}/", root.trim_end_matches('/')));
    if !inside {
        return Err(Error::permission_denied(format!(
            "path {:?} escapes {}",
            path, root
        )));
    }
    Ok(resolved)
}

/// Path of a confined container path relative to `root` (empty for `root` itself).
pub fn container_relpath(root: &str, resolved: &str) -> String {
    let root = normalize_posix(root);
    resolved
        .strip_prefix(root.as_str())
        .unwrap_or(resolved)
        .trim_start_matches('/')
        .to_string()
}

fn normalize_host(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve symlinks along the longest existing prefix of `path`.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest: Vec<std::ffi::OsString> = Vec::new();
    // symlink_metadata does not follow links, so a dangling link stops the walk.
    while std::fs::symlink_metadata(&existing).is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
    let mut resolved = existing.canonicalize().map_err(|e| {
        Error::permission_denied(format!(
            "cannot resolve {}: {} (dangling symlink?)",
            existing.display(),
            e
        ))
    })?;
    for name in rest.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Resolve `relative` under the host directory `root`, following symlinks
/// that already exist on disk.
///
/// Performs blocking filesystem calls; run it on a blocking thread.
pub fn confine_host_path(root: &Path, relative: &Path) -> Result<PathBuf> {
    if relative.is_absolute() {
        return Err(Error::permission_denied(format!(
            "host path {} must be relative",
            relative.display()
        )));
    }
    let lexical_root = normalize_host(root);
    let lexical = normalize_host(&root.join(relative));
    if !lexical.starts_with(&lexical_root) {
        return Err(Error::permission_denied(format!(
            "path {} escapes {}",
            relative.display(),
            root.display()
        )));
    }

    let real_root = resolve_existing_prefix(&lexical_root)?;
    let real = resolve_existing_prefix(&lexical)?;
    if !real.starts_with(&real_root) {
        return Err(Error::permission_denied(format!(
            "path {} resolves outside {}",
            relative.display(),
            root.display()
        )));
    }
    Ok(real)
}
