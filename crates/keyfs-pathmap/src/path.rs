//! User path helpers
//!
//! Paths are absolute, `/`-separated and normalized: no empty, `.` or `..`
//! components and no trailing separator (except the root itself).

use keyfs_common::{Error, Result};

/// Root directory
pub const ROOT: &str = "/";

/// Storage keys minted for paths whose original key moved away live here
pub const REUSE_PREFIX: &str = "/.reuse/";

/// Normalize an absolute path, folding `.` and `..` components
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::invalid_argument(format!("path '{path}' is not absolute")));
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        return Ok(ROOT.to_string());
    }
    let mut normalized = String::with_capacity(path.len());
    for part in parts {
        normalized.push('/');
        normalized.push_str(part);
    }
    Ok(normalized)
}

/// Parent of a normalized path; `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

/// Last component of a normalized path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Append a component or a `/`-led suffix to a path
pub fn join(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        base.to_string()
    } else if base == ROOT {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// True if `path` lies strictly beneath `ancestor`
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return path != ROOT;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Fresh storage key for `path` at log position `sequence`
///
/// Every client replaying the log mints the same key.
pub fn reuse_key(sequence: i64, path: &str) -> String {
    format!("{REUSE_PREFIX}{sequence}{path}")
}

/// True for paths inside the reserved reuse area
pub fn is_reserved(path: &str) -> bool {
    path == REUSE_PREFIX.trim_end_matches('/') || path.starts_with(REUSE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("//a///b/").unwrap(), "/a/b");
        assert_eq!(normalize("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("/../..").unwrap(), "/");
        assert!(normalize("a/b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/a/b"), "b");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "/b/c"), "/a/b/c");
        assert_eq!(join("/a", ""), "/a");
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("/a/b", "/a"));
        assert!(!is_descendant("/ab", "/a"));
        assert!(!is_descendant("/a", "/a"));
        assert!(is_descendant("/a", "/"));
    }

    #[test]
    fn test_reuse_keys() {
        assert_eq!(reuse_key(7, "/docs"), "/.reuse/7/docs");
        assert!(is_reserved(&reuse_key(7, "/docs")));
        assert!(is_reserved("/.reuse"));
        assert!(!is_reserved("/.reused"));
    }
}
