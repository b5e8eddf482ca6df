//! Path parsing and normalisation for the virtual namespace.
//!
//! Paths are absolute, `/`-separated strings; `\` is accepted on input for
//! development on Windows-like hosts only. The normalised form collapses
//! `.`/`..` and redundant separators and never carries a trailing slash
//! (except the root itself).

use crate::error::{FsError, FsResult};

/// The root path.
pub const ROOT: &str = "/";

/// Normalise a raw path string into the canonical absolute form.
///
/// `..` above the root resolves to the root, matching POSIX realpath
/// behaviour for `/..`.
pub fn normalize(raw: &str) -> FsResult<String> {
    if raw.is_empty() {
        return Err(FsError::InvalidPath("empty path".to_string()));
    }
    let unified = raw.replace('\\', "/");
    if !unified.starts_with('/') {
        return Err(FsError::InvalidPath(format!("path is not absolute: {raw}")));
    }

    let mut parts: Vec<&str> = Vec::new();
    for comp in unified.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Ok(ROOT.to_string());
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Parent of a normalised path; `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT.to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Final component of a normalised path; the root's base name is `/`.
pub fn base_name(path: &str) -> &str {
    if path == ROOT {
        return ROOT;
    }
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Components of a normalised path, root excluded.
pub fn components(path: &str) -> Vec<&str> {
    if path == ROOT {
        return Vec::new();
    }
    path.trim_start_matches('/').split('/').collect()
}

/// Resolve `other` against `base`: absolute `other` wins, otherwise the two
/// are concatenated and re-normalised.
pub fn resolve(base: &str, other: &str) -> FsResult<String> {
    let unified = other.replace('\\', "/");
    if unified.starts_with('/') {
        return normalize(&unified);
    }
    if unified.is_empty() {
        return normalize(base);
    }
    normalize(&format!("{base}/{unified}"))
}

/// Relative path from `from` to `to`, both normalised. Walks up with `..`
/// past the common prefix the way java.nio `relativize` does.
pub fn relativize(from: &str, to: &str) -> String {
    if from == to {
        return String::new();
    }
    let from_parts = components(from);
    let to_parts = components(to);
    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out: Vec<&str> = Vec::new();
    for _ in common..from_parts.len() {
        out.push("..");
    }
    out.extend(&to_parts[common..]);
    out.join("/")
}

/// Raw string-prefix test. Intentionally not component-wise: `/ab` starts
/// with `/a` here, matching the behaviour callers already depend on.
pub fn starts_with(path: &str, prefix: &str) -> bool {
    path.starts_with(prefix)
}

/// Raw string-suffix test, same caveat as [`starts_with`].
pub fn ends_with(path: &str, suffix: &str) -> bool {
    path.ends_with(suffix)
}
