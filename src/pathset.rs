//! Path sets and site-relative path arithmetic.
//!
//! Dependency records store a set of site-relative paths as text: the sorted,
//! de-duplicated paths joined by `\n`. The empty string is the empty set, so a
//! file with no dependencies has a zero-length record. A path containing a
//! newline cannot be represented and is rejected rather than silently split.
//!
//! Site-relative paths are always `/`-separated strings, independent of the
//! host platform, which is why the helpers here work on `&str` instead of
//! `Path`.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum PathSetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
    #[error("Path contains a newline and cannot be stored in a path set: {0:?}")]
    Newline(String),
    #[error("Path is not valid UTF-8: {}", .0.display())]
    NotUtf8(PathBuf),
}

/// Encode a set of paths as a record.
pub fn serialize<I, S>(paths: I) -> Result<String, PathSetError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set = BTreeSet::new();
    for path in paths {
        let path = path.as_ref();
        if path.contains('\n') {
            return Err(PathSetError::Newline(path.to_string()));
        }
        set.insert(path.to_string());
    }
    Ok(set.into_iter().collect::<Vec<_>>().join("\n"))
}

/// Decode a record written by [`serialize`].
pub fn deserialize(text: &str) -> Vec<String> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').map(str::to_string).collect()
    }
}

/// Read and decode a path-set record from disk.
pub fn read(path: &Path) -> Result<Vec<String>, PathSetError> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|_| PathSetError::NotUtf8(path.to_path_buf()))?;
    Ok(deserialize(&text))
}

// ============================================================================
// Site-relative path helpers
// ============================================================================

/// Collapse `.`, `..` and repeated separators. An empty relative result is `.`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join two `/`-separated paths. An absolute `rel` replaces `base`.
pub fn join(base: &str, rel: &str) -> String {
    if rel.starts_with('/') || base.is_empty() {
        rel.to_string()
    } else if base.ends_with('/') {
        format!("{base}{rel}")
    } else {
        format!("{base}/{rel}")
    }
}

/// Everything before the last `/`, or `""` for a bare name.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => {
            let head = &path[..=i];
            let trimmed = head.trim_end_matches('/');
            if trimmed.is_empty() { head } else { trimmed }
        }
        None => "",
    }
}

/// Everything after the last `/`.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// All non-directory entries under `root` as sorted `/`-separated relative
/// paths.
pub fn relative_files_under(root: &Path) -> Result<Vec<String>, PathSetError> {
    relative_files_under_except(root, |_| false)
}

/// Like [`relative_files_under`], but skips every entry whose relative path
/// `exclude` accepts. Excluded directories are not descended into.
pub fn relative_files_under_except(
    root: &Path,
    mut exclude: impl FnMut(&str) -> bool,
) -> Result<Vec<String>, PathSetError> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match relative_string(entry.path(), root) {
            Ok(rel) => !exclude(&rel),
            // Kept so the error surfaces below
            Err(_) => true,
        });
    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        files.push(relative_string(entry.path(), root)?);
    }
    Ok(files)
}

/// `path` relative to `root`, as a `/`-separated string.
pub fn relative_string(path: &Path, root: &Path) -> Result<String, PathSetError> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts = rel
        .components()
        .map(|c| {
            c.as_os_str()
                .to_str()
                .ok_or_else(|| PathSetError::NotUtf8(path.to_path_buf()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("/"))
}
