//! Node path helpers
//!
//! Paths are absolute, `/`-separated and never end in a separator
//! (except the root itself).

use crate::error::StoreError;

/// Path separator
pub const SEPARATOR: char = '/';

/// Width of the zero-padded suffix appended to sequential node names
pub const SEQUENCE_WIDTH: usize = 10;

/// Validate an absolute node path
pub fn validate(path: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| Err(StoreError::InvalidArgument(format!("{path:?}: {reason}")));

    if !path.starts_with(SEPARATOR) {
        return invalid("path must start with /");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with(SEPARATOR) {
        return invalid("path must not end with /");
    }
    for segment in path[1..].split(SEPARATOR) {
        if segment.is_empty() {
            return invalid("empty path segment");
        }
        if segment == "." || segment == ".." {
            return invalid("relative path segment");
        }
        if segment.chars().any(|c| c == '\0' || c.is_control()) {
            return invalid("control character in path");
        }
    }
    Ok(())
}

/// Parent of a node path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a node path
pub fn node_name(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// All proper ancestors of a path, root excluded, shallowest first
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if p == "/" {
            break;
        }
        out.push(p);
        current = parent(p);
    }
    out.reverse();
    out
}

/// Append a store-assigned sequence number to a node name
pub fn with_sequence(name: &str, sequence: u64) -> String {
    format!("{name}{sequence:0width$}", width = SEQUENCE_WIDTH)
}

/// Sequence number of a sequential node name
pub fn sequence_of(name: &str) -> Option<u64> {
    let suffix = name.get(name.len().checked_sub(SEQUENCE_WIDTH)?..)?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
