//! Package discovery, installation and the in-memory catalog.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use walkdir::WalkDir;

use super::manifest::PackageManifest;
use super::paths;
use super::{
    InstanceHandle, PackageState, PackageSummary, PermissionSet, PluginError, PluginResult,
    MANIFEST_FILE,
};

/// Identifiers double as directory names under the packages root.
static SAFE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("package id pattern is valid")
});

/// Whether `id` can be used as a directory name under the packages root.
pub fn is_safe_identifier(id: &str) -> bool {
    SAFE_ID.is_match(id) && !id.contains("..")
}

/// A discovered package and its runtime state.
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    /// Package manifest (a placeholder when the real one is unusable).
    pub manifest: PackageManifest,
    /// Package directory.
    pub path: PathBuf,
    pub state: PackageState,
    /// Why the package is in `error` state.
    pub error: Option<String>,
    /// Handle of the running sandbox instance, if any.
    pub instance: Option<InstanceHandle>,
}

impl LoadedPackage {
    fn installed(manifest: PackageManifest, path: PathBuf) -> Self {
        Self { manifest, path, state: PackageState::Installed, error: None, instance: None }
    }

    fn errored(manifest: PackageManifest, path: PathBuf, error: String) -> Self {
        Self { manifest, path, state: PackageState::Error, error: Some(error), instance: None }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Absolute path of the entry point.
    pub fn entry_path(&self) -> PathBuf {
        self.manifest.entry_path(&self.path)
    }

    pub fn permissions(&self) -> PermissionSet {
        self.manifest.permission_set()
    }

    pub fn summary(&self) -> PackageSummary {
        PackageSummary::from(self)
    }
}

/// Owns the packages directory and the catalog of discovered packages.
///
/// Catalog order is discovery order.
#[derive(Debug)]
pub struct PackageLoader {
    packages_dir: PathBuf,
    catalog: Vec<LoadedPackage>,
}

impl PackageLoader {
    /// Create a loader rooted at `packages_dir`, creating the directory if needed.
    pub fn new(packages_dir: PathBuf) -> PluginResult<Self> {
        std::fs::create_dir_all(&packages_dir)?;
        Ok(Self { packages_dir, catalog: Vec::new() })
    }

    pub fn packages_dir(&self) -> &Path {
        &self.packages_dir
    }

    /// Scan the packages root and rebuild the catalog.
    ///
    /// Subdirectories without a manifest are skipped. Any other problem is
    /// recorded on that package as an `error` entry; it never aborts the scan.
    /// Returns the rebuilt catalog.
    pub fn discover(&mut self) -> Vec<LoadedPackage> {
        let entries = match std::fs::read_dir(&self.packages_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    dir = %self.packages_dir.display(),
                    error = %e,
                    "Cannot scan packages directory"
                );
                return Vec::new();
            }
        };

        let mut discovered = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            if let Some(package) = Self::load_package(&path) {
                discovered.push(package);
            }
        }

        self.catalog.clear();
        for package in discovered {
            self.admit(package);
        }

        tracing::info!(
            count = self.catalog.len(),
            errors = self.catalog.iter().filter(|p| p.state == PackageState::Error).count(),
            "Package discovery finished"
        );

        self.catalog.clone()
    }

    /// Read and check one package directory.
    ///
    /// Returns `None` when the directory has no manifest (not a package).
    /// A manifest that cannot be used yields an `error` entry keyed by the
    /// directory name.
    pub fn load_package(dir: &Path) -> Option<LoadedPackage> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            tracing::debug!(dir = %dir.display(), "No manifest, skipping directory");
            return None;
        }

        let dir_name =
            dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let path = dir.to_path_buf();

        let content = match std::fs::read_to_string(&manifest_path) {
            Ok(content) => content,
            Err(e) => {
                let placeholder = PackageManifest::placeholder(&dir_name, None);
                return Some(LoadedPackage::errored(
                    placeholder,
                    path,
                    format!("Failed to read {MANIFEST_FILE}: {e}"),
                ));
            }
        };

        let raw: Value = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                let placeholder = PackageManifest::placeholder(&dir_name, None);
                return Some(LoadedPackage::errored(
                    placeholder,
                    path,
                    format!("Invalid {MANIFEST_FILE}: {e}"),
                ));
            }
        };

        let manifest = match PackageManifest::from_value(raw.clone()) {
            Ok(manifest) => manifest,
            Err(e) => {
                let placeholder = PackageManifest::placeholder(&dir_name, Some(&raw));
                return Some(LoadedPackage::errored(placeholder, path, e.to_string()));
            }
        };

        let Some(entry) = paths::resolve_within(dir, dir, &manifest.main) else {
            let message =
                format!("Entry point '{}' is outside the package directory", manifest.main);
            return Some(LoadedPackage::errored(manifest, path, message));
        };

        if !entry.is_file() {
            let message = format!("Entry point not found: {}", manifest.main);
            return Some(LoadedPackage::errored(manifest, path, message));
        }

        Some(LoadedPackage::installed(manifest, path))
    }

    /// Copy a package directory into the packages root and load it.
    ///
    /// `source` may be the package directory or its `manifest.json`. Any
    /// existing copy is replaced. Failures are logged and yield `None`.
    pub fn install(&mut self, source: &Path) -> Option<LoadedPackage> {
        match self.try_install(source) {
            Ok(package) => {
                tracing::info!(
                    package = %package.id(),
                    state = %package.state,
                    "Package installed"
                );
                Some(package)
            }
            Err(e) => {
                tracing::error!(source = %source.display(), error = %e, "Package install failed");
                None
            }
        }
    }

    /// Package directory and identifier of an install source.
    ///
    /// `source` may be the package directory or its `manifest.json`.
    pub fn inspect_source(source: &Path) -> PluginResult<(PathBuf, String)> {
        let source_dir = if source.is_file()
            && source.file_name().is_some_and(|name| name == MANIFEST_FILE)
        {
            source.parent().unwrap_or(source)
        } else {
            source
        };

        if !source_dir.is_dir() {
            return Err(PluginError::NotFound(source.display().to_string()));
        }

        let content = std::fs::read_to_string(source_dir.join(MANIFEST_FILE)).map_err(|_| {
            PluginError::InvalidManifest(format!(
                "No {MANIFEST_FILE} found in {}",
                source_dir.display()
            ))
        })?;
        let raw: Value = serde_json::from_str(&content)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::InvalidManifest("Manifest has no 'id'".to_string()))?;

        if !is_safe_identifier(id) {
            return Err(PluginError::InvalidManifest(format!(
                "Package id '{id}' cannot be used as a directory name"
            )));
        }

        Ok((source_dir.to_path_buf(), id.to_string()))
    }

    fn try_install(&mut self, source: &Path) -> PluginResult<LoadedPackage> {
        let (source_dir, id) = Self::inspect_source(source)?;
        let source_dir = source_dir.as_path();
        let id = id.as_str();

        let target = self.packages_dir.join(id);
        if same_directory(source_dir, &target) {
            tracing::debug!(package = %id, "Source already in packages directory, skipping copy");
        } else {
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            copy_dir(source_dir, &target)?;
        }

        let package = Self::load_package(&target).ok_or_else(|| {
            PluginError::LoadError(format!("{} vanished after copy", target.display()))
        })?;
        self.upsert(package.clone());

        Ok(package)
    }

    /// Delete a package directory and drop it from the catalog.
    ///
    /// Returns `false` for unknown identifiers or when deletion fails.
    pub fn uninstall(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            tracing::warn!(package = %id, "Cannot uninstall unknown package");
            return false;
        };

        let path = self.catalog[index].path.clone();
        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                tracing::error!(
                    package = %id,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove package directory"
                );
                return false;
            }
        }

        self.catalog.remove(index);
        tracing::info!(package = %id, "Package uninstalled");
        true
    }

    /// Set the state tag of a catalog entry. Leaving `error` clears the message.
    pub fn set_state(&mut self, id: &str, state: PackageState) -> bool {
        let Some(package) = self.get_mut(id) else {
            return false;
        };
        package.state = state;
        if state != PackageState::Error {
            package.error = None;
        }
        true
    }

    /// Tag a catalog entry as `error` with a message.
    pub fn mark_error(&mut self, id: &str, message: impl Into<String>) -> bool {
        let Some(package) = self.get_mut(id) else {
            return false;
        };
        package.state = PackageState::Error;
        package.error = Some(message.into());
        package.instance = None;
        true
    }

    /// Record (or clear) the running-instance handle of a package.
    pub fn set_instance(&mut self, id: &str, instance: Option<InstanceHandle>) -> bool {
        let Some(package) = self.get_mut(id) else {
            return false;
        };
        package.instance = instance;
        true
    }

    pub fn get(&self, id: &str) -> Option<&LoadedPackage> {
        self.catalog.iter().find(|p| p.id() == id)
    }

    /// All catalog entries in discovery order.
    pub fn list(&self) -> &[LoadedPackage] {
        &self.catalog
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut LoadedPackage> {
        self.catalog.iter_mut().find(|p| p.id() == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.catalog.iter().position(|p| p.id() == id)
    }

    /// Add a freshly scanned package to the catalog.
    ///
    /// An `error` entry never displaces a usable package with the same id.
    /// Between two usable packages the later one wins.
    fn admit(&mut self, package: LoadedPackage) {
        let Some(index) = self.position(package.id()) else {
            self.catalog.push(package);
            return;
        };

        let existing = &self.catalog[index];
        if package.state == PackageState::Error && existing.state != PackageState::Error {
            tracing::warn!(
                package = %package.id(),
                kept = %existing.path.display(),
                ignored = %package.path.display(),
                error = package.error.as_deref().unwrap_or_default(),
                "Ignoring broken duplicate of a package"
            );
            return;
        }

        self.upsert(package);
    }

    fn upsert(&mut self, package: LoadedPackage) {
        if let Some(index) = self.position(package.id()) {
            if self.catalog[index].path != package.path {
                tracing::warn!(
                    package = %package.id(),
                    kept = %package.path.display(),
                    replaced = %self.catalog[index].path.display(),
                    "Duplicate package id"
                );
            }
            self.catalog[index] = package;
        } else {
            self.catalog.push(package);
        }
    }
}

fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Recursively copy a directory tree. Symlinks are not followed or copied.
fn copy_dir(source: &Path, target: &Path) -> PluginResult<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| PluginError::LoadError(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| PluginError::LoadError(e.to_string()))?;
        let dest = target.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)?;
        } else {
            tracing::warn!(
                path = %entry.path().display(),
                "Skipping non-regular file during install"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_package(root: &Path, dir: &str, id: &str, main: &str) -> PathBuf {
        let package_dir = root.join(dir);
        std::fs::create_dir_all(&package_dir).unwrap();
        let manifest = serde_json::json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "main": main,
            "author": "A",
            "description": "D",
            "permissions": []
        });
        std::fs::write(package_dir.join(MANIFEST_FILE), manifest.to_string()).unwrap();
        std::fs::write(package_dir.join("index.js"), "module.exports = {};").unwrap();
        package_dir
    }

    #[test]
    fn test_new_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("plugins");
        let loader = PackageLoader::new(root.clone()).unwrap();
        assert!(root.is_dir());
        assert!(loader.is_empty());
    }

    #[test]
    fn test_discover_valid_package() {
        let temp_dir = TempDir::new().unwrap();
        write_package(temp_dir.path(), "word-count", "word-count", "index.js");

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        let found = loader.discover();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].state, PackageState::Installed);
        assert_eq!(
            loader.get("word-count").unwrap().entry_path(),
            temp_dir.path().join("word-count/index.js")
        );
    }

    #[test]
    fn test_directory_without_manifest_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("not-a-package")).unwrap();
        std::fs::write(temp_dir.path().join("stray.txt"), "x").unwrap();

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        assert!(loader.discover().is_empty());
    }

    #[test]
    fn test_missing_entry_point_is_error() {
        let temp_dir = TempDir::new().unwrap();
        write_package(temp_dir.path(), "broken", "broken", "missing.js");

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        let found = loader.discover();

        assert_eq!(found[0].state, PackageState::Error);
        assert!(found[0].error.as_deref().unwrap().contains("missing.js"));
    }

    #[test]
    fn test_entry_point_outside_package_is_error() {
        let temp_dir = TempDir::new().unwrap();
        write_package(temp_dir.path(), "sneaky", "sneaky", "../other/index.js");
        write_package(temp_dir.path(), "other", "other", "index.js");

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        loader.discover();

        let sneaky = loader.get("sneaky").unwrap();
        assert_eq!(sneaky.state, PackageState::Error);
        assert!(sneaky.error.as_deref().unwrap().contains("outside"));
    }

    #[test]
    fn test_corrupt_manifest_keyed_by_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("garbled");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), "{ nope").unwrap();

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        loader.discover();

        let package = loader.get("garbled").unwrap();
        assert_eq!(package.state, PackageState::Error);
    }

    #[test]
    fn test_broken_copy_does_not_shadow_valid_package() {
        let temp_dir = TempDir::new().unwrap();
        write_package(temp_dir.path(), "word-count", "word-count", "index.js");
        write_package(temp_dir.path(), "zzz", "zzz", "index.js");
        let stale = temp_dir.path().join("word-count-old");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join(MANIFEST_FILE), r#"{"id":"word-count","name":"old"}"#).unwrap();

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        let found = loader.discover();

        assert_eq!(found.len(), 3);
        assert_eq!(loader.len(), 3);
        let valid = loader.get("word-count").unwrap();
        assert_eq!(valid.state, PackageState::Installed);
        assert_eq!(valid.path, temp_dir.path().join("word-count"));

        let broken = loader.get("word-count-old").unwrap();
        assert_eq!(broken.state, PackageState::Error);
        assert_eq!(broken.manifest.name, "old");
        assert!(broken.error.as_deref().unwrap().contains("version"));
    }

    #[test]
    fn test_broken_entry_point_duplicate_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        write_package(temp_dir.path(), "a-copy", "word-count", "missing.js");
        write_package(temp_dir.path(), "word-count", "word-count", "index.js");

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        loader.discover();

        let package = loader.get("word-count").unwrap();
        assert_eq!(package.state, PackageState::Installed);
        assert_eq!(package.path, temp_dir.path().join("word-count"));
    }

    #[test]
    fn test_install_copies_tree() {
        let temp_dir = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let source_dir = write_package(source.path(), "src-dir", "word-count", "index.js");
        std::fs::create_dir_all(source_dir.join("lib")).unwrap();
        std::fs::write(source_dir.join("lib/util.js"), "module.exports = 1;").unwrap();

        let mut loader = PackageLoader::new(temp_dir.path().join("plugins")).unwrap();
        let package = loader.install(&source_dir).unwrap();

        assert_eq!(package.id(), "word-count");
        assert_eq!(package.state, PackageState::Installed);
        assert!(temp_dir.path().join("plugins/word-count/lib/util.js").is_file());
        assert_eq!(loader.len(), 1);
    }

    #[test]
    fn test_install_from_manifest_path_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let source_dir = write_package(source.path(), "pkg", "word-count", "index.js");

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        loader.install(&source_dir).unwrap();
        std::fs::write(temp_dir.path().join("word-count/stale.js"), "").unwrap();

        loader.install(&source_dir.join(MANIFEST_FILE)).unwrap();
        assert!(!temp_dir.path().join("word-count/stale.js").exists());
        assert_eq!(loader.len(), 1);
    }

    #[test]
    fn test_install_without_manifest_fails() {
        let temp_dir = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        assert!(loader.install(source.path()).is_none());
        assert!(loader.install(&source.path().join("nope")).is_none());
    }

    #[test]
    fn test_install_rejects_unsafe_id() {
        let temp_dir = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let source_dir = write_package(source.path(), "pkg", "../escape", "index.js");

        let mut loader = PackageLoader::new(temp_dir.path().join("plugins")).unwrap();
        assert!(loader.install(&source_dir).is_none());
        assert!(!temp_dir.path().join("escape").exists());
    }

    #[test]
    fn test_uninstall() {
        let temp_dir = TempDir::new().unwrap();
        write_package(temp_dir.path(), "word-count", "word-count", "index.js");

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        loader.discover();

        assert!(loader.uninstall("word-count"));
        assert!(!temp_dir.path().join("word-count").exists());
        assert!(loader.get("word-count").is_none());
        assert!(!loader.uninstall("word-count"));
    }

    #[test]
    fn test_state_mutation() {
        let temp_dir = TempDir::new().unwrap();
        write_package(temp_dir.path(), "word-count", "word-count", "index.js");

        let mut loader = PackageLoader::new(temp_dir.path().to_path_buf()).unwrap();
        loader.discover();

        assert!(loader.mark_error("word-count", "boom"));
        assert_eq!(loader.get("word-count").unwrap().error.as_deref(), Some("boom"));

        assert!(loader.set_state("word-count", PackageState::Disabled));
        let package = loader.get("word-count").unwrap();
        assert_eq!(package.state, PackageState::Disabled);
        assert!(package.error.is_none());

        assert!(!loader.set_state("missing", PackageState::Enabled));
    }

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("word-count"));
        assert!(is_safe_identifier("com.example.tool_2"));
        assert!(!is_safe_identifier("../x"));
        assert!(!is_safe_identifier("a/b"));
        assert!(!is_safe_identifier(".hidden"));
        assert!(!is_safe_identifier("a..b"));
        assert!(!is_safe_identifier(""));
    }
}
