//! Path Safety Guard: identifier validation and root-confined path
//! resolution. Every filesystem-facing operation applies both checks
//! before touching disk.

use crate::error::{BerthError, Result};
use std::path::{Component, Path, PathBuf};

/// Validate an untrusted instance id or archive filename.
///
/// Accepts only alphanumerics, `_`, `-` and `.`, and rejects any value
/// containing a parent-directory segment. This is independent of
/// [`resolve_under`]; callers apply both.
pub fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BerthError::Validation("identifier is empty".to_string()));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(BerthError::Validation(format!(
            "identifier '{}' contains characters outside [A-Za-z0-9._-]",
            id
        )));
    }

    // "." and ".." pass the character class above; both are path
    // meta-segments, not names. "." normalizes to the root itself, so an
    // operation keyed on it would hit every instance's data at once.
    if id == "." || id.contains("..") {
        return Err(BerthError::Validation(format!(
            "identifier '{}' is a path segment, not a name",
            id
        )));
    }

    Ok(())
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// consulting the filesystem, so paths that do not exist yet can still be
/// checked.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve `candidate` under `root` and fail with [`BerthError::OutsideRoot`]
/// unless the result is the root itself or a strict descendant of it.
///
/// The containment check compares path components, not string prefixes,
/// so `/data/ab` is not considered inside `/data/a`.
pub fn resolve_under(root: &Path, candidate: &str) -> Result<PathBuf> {
    let root = normalize(root);
    let resolved = normalize(&root.join(candidate));

    if resolved == root || resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(BerthError::OutsideRoot(format!(
            "'{}' resolves outside {}",
            candidate,
            root.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_charset() {
        assert!(validate_identifier("app-1_v2.0").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a/b").is_err());
        assert!(validate_identifier(".").is_err());
        assert!(validate_identifier("..").is_err());
        assert!(validate_identifier("a..b").is_err());
        assert!(validate_identifier("a b").is_err());
    }

    #[test]
    fn resolve_rejects_escape() {
        let root = Path::new("/data/volumes");
        assert!(resolve_under(root, "../outside").is_err());
        assert!(resolve_under(root, "a/../../outside").is_err());
        assert_eq!(
            resolve_under(root, "app1").unwrap(),
            PathBuf::from("/data/volumes/app1")
        );
        // Root itself is allowed.
        assert_eq!(resolve_under(root, "").unwrap(), PathBuf::from("/data/volumes"));
    }

    #[test]
    fn resolve_is_component_wise() {
        // starts_with on Path compares components, so a sibling sharing a
        // string prefix must not pass.
        let inside = resolve_under(Path::new("/data/a"), "x").unwrap();
        assert!(inside.starts_with("/data/a"));
        assert!(!PathBuf::from("/data/ab").starts_with("/data/a"));
    }
}
