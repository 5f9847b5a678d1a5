//! Single-segment identifier validation and path containment checks.
//!
//! Every path-taking surface (project root, workspace path, relative-path
//! join) must run the candidate through [`validate_id`] (for the user-
//! supplied segment) and [`contained_in`] (for the final resolved path)
//! before touching the filesystem or an object-store key.

use crate::error::Error;
use std::path::{Component, Path, PathBuf};

/// Validate a project or session identifier.
///
/// Empty input is permitted and returned unchanged — callers that need a
/// non-empty id enforce that separately; this function only rejects
/// identifiers that would escape their intended scope.
pub fn validate_id(s: &str) -> Result<String, Error> {
    if s.is_empty() {
        return Ok(String::new());
    }
    if s == "." || s == ".." {
        return Err(Error::InvalidId(s.to_string()));
    }
    if s.contains('/') || s.contains('\\') {
        return Err(Error::InvalidId(s.to_string()));
    }
    if s.starts_with('/') {
        return Err(Error::InvalidId(s.to_string()));
    }

    let cleaned = clean(s);
    if cleaned != s {
        return Err(Error::InvalidId(s.to_string()));
    }

    Ok(s.to_string())
}

/// `path.Clean`-style lexical normalization: collapse `.` segments and
/// `//` duplicates. Does not touch `..` semantics — callers reject `..`
/// outright via [`validate_id`] or resolve it via [`contained_in`].
fn clean(s: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in s.split('/') {
        match segment {
            "" | "." => continue,
            other => out.push(other),
        }
    }
    out.join("/")
}

/// Compute `path` relative to `root` and reject any result that escapes
/// `root` (`".."` or anything starting with `".." + separator`).
///
/// Mirrors the Go idiom `filepath.Rel(root, candidate)` followed by a
/// containment check; used as the final gate before any I/O against a
/// resolved filesystem path.
pub fn contained_in(root: &Path, candidate: &Path) -> Result<PathBuf, Error> {
    let rel = relative_to(root, candidate).ok_or_else(|| Error::PathOutsideRoot {
        root: root.display().to_string(),
        path: candidate.display().to_string(),
    })?;

    if rel == Path::new("..") || rel.starts_with("..") {
        return Err(Error::PathOutsideRoot {
            root: root.display().to_string(),
            path: candidate.display().to_string(),
        });
    }

    Ok(rel)
}

/// Lexically resolve `candidate` relative to `root` without touching the
/// filesystem (neither path need exist). Returns `None` if the two paths
/// do not share a common lexical ancestor representation (e.g. different
/// drive roots on Windows, which cannot happen on the Unix paths this
/// service targets but is handled defensively).
fn relative_to(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let root_normalized = normalize(root);
    let candidate_normalized = normalize(candidate);
    let root_components: Vec<Component> = root_normalized.components().collect();
    let candidate_components: Vec<Component> = candidate_normalized.components().collect();

    let common = root_components
        .iter()
        .zip(candidate_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..root_components.len() {
        rel.push("..");
    }
    for comp in &candidate_components[common..] {
        rel.push(comp.as_os_str());
    }

    if rel.as_os_str().is_empty() {
        rel.push(".");
    }

    Some(rel)
}

/// Lexically normalize `..` and `.` components without resolving symlinks
/// (the paths being joined here frequently do not exist yet).
fn normalize(path: &Path) -> PathBuf {
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

/// Join a validated relative path onto `root`, refusing absolute paths,
/// backslashes, and `..` segments in `relative`, then re-checking
/// containment on the resolved result.
pub fn join_contained(root: &Path, relative: &str) -> Result<PathBuf, Error> {
    if relative.is_empty() {
        return Err(Error::InvalidPath {
            path: relative.to_string(),
            reason: "empty relative path".into(),
        });
    }
    if relative.starts_with('/') || relative.contains('\\') {
        return Err(Error::InvalidPath {
            path: relative.to_string(),
            reason: "must be a relative, forward-slash path".into(),
        });
    }
    if relative.split('/').any(|seg| seg == "..") {
        return Err(Error::InvalidPath {
            path: relative.to_string(),
            reason: "must not contain '..' segments".into(),
        });
    }

    let candidate = root.join(relative);
    let _ = contained_in(root, &candidate)?;
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_empty_and_simple_ids() {
        assert_eq!(validate_id("").unwrap(), "");
        assert_eq!(validate_id("abc-123").unwrap(), "abc-123");
        assert_eq!(validate_id("proj_1").unwrap(), "proj_1");
    }

    #[test]
    fn rejects_dot_and_dotdot() {
        assert!(validate_id(".").is_err());
        assert!(validate_id("..").is_err());
    }

    #[test]
    fn rejects_separators_and_traversal() {
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a\\b").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("/abs").is_err());
    }

    #[test]
    fn rejects_non_canonical() {
        // "a//b" cleans to "a/b" which already contains a separator and is
        // rejected above, but "./a" cleans to "a" — not equal to input.
        assert!(validate_id("./a").is_err());
    }

    #[test]
    fn contained_in_rejects_escape() {
        let root = Path::new("/data/root");
        assert!(contained_in(root, Path::new("/data/root/sub")).is_ok());
        assert!(contained_in(root, Path::new("/data/other")).is_err());
        assert!(contained_in(root, Path::new("/data")).is_err());
    }

    #[test]
    fn join_contained_rejects_traversal_and_absolute() {
        let root = Path::new("/data/root");
        assert!(join_contained(root, "files/a.txt").is_ok());
        assert!(join_contained(root, "../escape").is_err());
        assert!(join_contained(root, "/abs").is_err());
        assert!(join_contained(root, "a\\b").is_err());
        assert!(join_contained(root, "a/../../escape").is_err());
    }
}
