//! Path containment helpers shared by the loader and the sandbox.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.` and fold `..` into its parent.
///
/// Does not touch the filesystem. A `..` that would climb above the first
/// component is kept, so the result still fails a `starts_with` check.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if popped {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join `relative` onto `base` and return the result only if it stays inside `root`.
///
/// Absolute `relative` paths are rejected.
pub fn resolve_within(root: &Path, base: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.is_absolute() || relative.has_root() {
        return None;
    }

    let root = normalize(root);
    let candidate = normalize(&base.join(relative));
    candidate.starts_with(&root).then_some(candidate)
}

/// Check that an existing path, after resolving symlinks, is still inside `root`.
pub fn canonical_within(root: &Path, path: &Path) -> bool {
    match (root.canonicalize(), path.canonicalize()) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    }
}
