//! Utility functions for Rewind
//!
//! Helpers for repository-relative paths and human-readable output.
//!
//! Repository paths are plain UTF-8 strings using `/` as separator, with no
//! leading or trailing separator and no `.`/`..` segments. The empty string
//! names the repository root.
//!
//! ```rust
//! use rewind::utils::{ancestors, join_path, normalize_path, parent_and_name};
//!
//! assert_eq!(normalize_path("/docs/report.txt/").unwrap(), "docs/report.txt");
//! assert!(normalize_path("docs/../etc").is_err());
//!
//! assert_eq!(join_path("docs", "a.txt"), "docs/a.txt");
//! assert_eq!(join_path("", "a.txt"), "a.txt");
//! assert_eq!(parent_and_name("docs/a.txt"), ("docs", "a.txt"));
//! assert_eq!(ancestors("a/b/c").collect::<Vec<_>>(), vec!["a", "a/b"]);
//! ```

use crate::error::{Result, RewindError};

/// Validate a repository-relative path
///
/// # Errors
///
/// Returns [`RewindError::InvalidPath`] if the path has a leading or
/// trailing separator, an empty segment, a `.` or `..` segment, or a NUL
/// byte.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    if path.contains('\0') {
        return Err(RewindError::InvalidPath(path.to_string()));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(RewindError::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}

/// Strip leading and trailing separators, then validate
///
/// This is the boundary used for paths coming from callers, which may be
/// written as `/docs/` or `docs`.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    validate_path(trimmed)?;
    Ok(trimmed.to_string())
}

/// Join a directory path and a child name
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Split a path into its parent directory and final segment
///
/// The parent of a top-level entry is the root (`""`).
pub fn parent_and_name(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// Proper ancestors of a path, outermost first, excluding the root
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(idx, _)| &path[..idx])
}

/// Format bytes in human-readable form
///
/// # Example
///
/// ```rust
/// use rewind::utils::format_bytes;
///
/// assert_eq!(format_bytes(0), "0 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
