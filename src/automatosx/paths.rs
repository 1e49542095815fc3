//! Cross-platform path rules for stored paths.
//!
//! Every path the core persists (session journals, checkpoints, workspace
//! references, memory export metadata) is stored in forward-slash form so
//! that a project directory can move between operating systems without
//! rewriting its `.automatosx/` state. Comparisons are case-insensitive on
//! Windows and case-sensitive elsewhere. UNC (`\\server\share`) and
//! drive-letter (`C:\`) prefixes are recognized for absoluteness checks
//! even when the binary runs on a non-Windows host, since stored paths may
//! have been written by a Windows machine.

use std::path::Path;

/// Convert a path to its stored, forward-slash form.
///
/// Backslashes are replaced wholesale; the function never touches drive
/// letters or UNC prefixes beyond separator normalization.
///
/// # Example
///
/// ```rust
/// use automatosx::paths::to_storage_path;
///
/// assert_eq!(to_storage_path(r"workspaces\backend\out.md"), "workspaces/backend/out.md");
/// assert_eq!(to_storage_path("workspaces/backend"), "workspaces/backend");
/// ```
pub fn to_storage_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Convert a [`Path`] to its stored form.
pub fn path_to_storage(path: &Path) -> String {
    to_storage_path(&path.to_string_lossy())
}

/// Report whether a stored path is absolute on any supported platform.
///
/// Recognizes POSIX roots (`/…`), drive-letter prefixes (`C:\…`, `C:/…`)
/// and UNC prefixes (`\\server\share`, `//server/share`).
///
/// # Example
///
/// ```rust
/// use automatosx::paths::is_absolute_path;
///
/// assert!(is_absolute_path("/var/data"));
/// assert!(is_absolute_path("C:/Users/dev"));
/// assert!(is_absolute_path(r"\\fileserver\projects"));
/// assert!(!is_absolute_path("workspaces/backend"));
/// ```
pub fn is_absolute_path(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    has_drive_prefix(path)
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(letter), Some(':'), Some(sep)) => {
            letter.is_ascii_alphabetic() && (sep == '/' || sep == '\\')
        }
        _ => false,
    }
}

/// Compare two stored paths under the platform's case rules.
///
/// Separators are normalized before comparison, so `a\b` and `a/b` are
/// always equal. On Windows the comparison is case-insensitive.
pub fn paths_equal(a: &str, b: &str) -> bool {
    let a = to_storage_path(a);
    let b = to_storage_path(b);
    if cfg!(windows) {
        a.to_lowercase() == b.to_lowercase()
    } else {
        a == b
    }
}

/// Join a stored relative path onto a base, keeping the stored form.
pub fn join_storage_path(base: &str, rel: &str) -> String {
    let base = to_storage_path(base);
    let rel = to_storage_path(rel);
    if base.is_empty() {
        return rel;
    }
    if base.ends_with('/') {
        format!("{}{}", base, rel)
    } else {
        format!("{}/{}", base, rel)
    }
}
