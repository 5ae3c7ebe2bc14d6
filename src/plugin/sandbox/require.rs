//! Resolution of guest `require` specifiers.
//!
//! A specifier is either one of the allow-listed host modules or a relative
//! path that stays inside the package directory. Anything else is refused.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::plugin::paths;

/// Side-effect-free host modules guest code may require.
pub const HOST_MODULES: &[&str] = &["path", "events", "util"];

/// Why a `require` call failed. The message is what guest code sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequireError {
    #[error("Module not allowed: {0}")]
    NotAllowed(String),

    #[error("Cannot require outside plugin directory: {0}")]
    OutsidePackage(String),

    #[error("Cannot find module '{0}'")]
    NotFound(String),
}

/// What a specifier resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedModule {
    /// One of [`HOST_MODULES`].
    Builtin(&'static str),
    /// A script file inside the package.
    Script(PathBuf),
    /// A JSON file inside the package.
    Json(PathBuf),
}

impl ResolvedModule {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Builtin(_) => None,
            Self::Script(path) | Self::Json(path) => Some(path),
        }
    }
}

fn is_relative_specifier(specifier: &str) -> bool {
    matches!(specifier, "." | "..") || specifier.starts_with("./") || specifier.starts_with("../")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Resolve `specifier` as required from a module living in `from_dir`.
///
/// Relative specifiers try the exact path, then `.js`, then `.json`, then
/// `index.js` inside a directory of that name.
pub fn resolve(
    package_root: &Path,
    from_dir: &Path,
    specifier: &str,
) -> Result<ResolvedModule, RequireError> {
    let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
    if let Some(name) = HOST_MODULES.iter().find(|m| **m == bare) {
        return Ok(ResolvedModule::Builtin(name));
    }

    if Path::new(specifier).has_root() {
        return Err(RequireError::OutsidePackage(specifier.to_string()));
    }
    if !is_relative_specifier(specifier) {
        return Err(RequireError::NotAllowed(specifier.to_string()));
    }

    let base = paths::resolve_within(package_root, from_dir, specifier)
        .ok_or_else(|| RequireError::OutsidePackage(specifier.to_string()))?;

    let candidates = [
        base.clone(),
        with_suffix(&base, ".js"),
        with_suffix(&base, ".json"),
        base.join("index.js"),
    ];
    let found = candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| RequireError::NotFound(specifier.to_string()))?;

    // A symlink inside the package may still point elsewhere.
    if !paths::canonical_within(package_root, &found) {
        return Err(RequireError::OutsidePackage(specifier.to_string()));
    }

    if found.extension().is_some_and(|ext| ext == "json") {
        Ok(ResolvedModule::Json(found))
    } else {
        Ok(ResolvedModule::Script(found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn package() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("word-count");
        std::fs::create_dir_all(root.join("lib/strings")).unwrap();
        std::fs::write(root.join("index.js"), "").unwrap();
        std::fs::write(root.join("lib/count.js"), "").unwrap();
        std::fs::write(root.join("lib/data.json"), "{}").unwrap();
        std::fs::write(root.join("lib/strings/index.js"), "").unwrap();
        std::fs::write(temp_dir.path().join("secrets.js"), "").unwrap();
        (temp_dir, root)
    }

    #[test]
    fn test_host_modules() {
        let (_temp_dir, root) = package();
        assert_eq!(resolve(&root, &root, "path").unwrap(), ResolvedModule::Builtin("path"));
        assert_eq!(
            resolve(&root, &root, "node:events").unwrap(),
            ResolvedModule::Builtin("events")
        );
    }

    #[test]
    fn test_disallowed_module() {
        let (_temp_dir, root) = package();
        let err = resolve(&root, &root, "fs").unwrap_err();
        assert_eq!(err.to_string(), "Module not allowed: fs");
        assert!(matches!(
            resolve(&root, &root, "node:child_process"),
            Err(RequireError::NotAllowed(_))
        ));
    }

    #[test]
    fn test_escape_is_refused() {
        let (_temp_dir, root) = package();
        let err = resolve(&root, &root, "../../secrets.js").unwrap_err();
        assert_eq!(err.to_string(), "Cannot require outside plugin directory: ../../secrets.js");
        for specifier in ["../secrets.js", "/etc/passwd"] {
            assert!(matches!(
                resolve(&root, &root, specifier),
                Err(RequireError::OutsidePackage(_))
            ));
        }
    }

    #[test]
    fn test_extension_probing() {
        let (_temp_dir, root) = package();
        assert_eq!(
            resolve(&root, &root, "./lib/count").unwrap(),
            ResolvedModule::Script(root.join("lib/count.js"))
        );
        assert_eq!(
            resolve(&root, &root, "./lib/data").unwrap(),
            ResolvedModule::Json(root.join("lib/data.json"))
        );
        assert_eq!(
            resolve(&root, &root, "./lib/strings").unwrap(),
            ResolvedModule::Script(root.join("lib/strings/index.js"))
        );
    }

    #[test]
    fn test_relative_to_requiring_module() {
        let (_temp_dir, root) = package();
        let from = root.join("lib/strings");
        assert_eq!(
            resolve(&root, &from, "../count.js").unwrap().path(),
            Some(root.join("lib/count.js").as_path())
        );
        assert_eq!(
            resolve(&root, &from, "../../index").unwrap().path(),
            Some(root.join("index.js").as_path())
        );
    }

    #[test]
    fn test_missing_module() {
        let (_temp_dir, root) = package();
        assert_eq!(
            resolve(&root, &root, "./nope").unwrap_err(),
            RequireError::NotFound("./nope".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_refused() {
        let (temp_dir, root) = package();
        let secrets = temp_dir.path().join("secrets.js");
        std::os::unix::fs::symlink(secrets, root.join("link.js")).unwrap();
        assert!(matches!(resolve(&root, &root, "./link.js"), Err(RequireError::OutsidePackage(_))));
    }
}
