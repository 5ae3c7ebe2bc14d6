//! Durable enabled-set and per-package settings.
//!
//! Backed by a single JSON file in the user-data directory. Every mutation
//! rewrites the whole file before returning.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{PluginError, PluginResult};

/// On-disk format of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSettings {
    #[serde(default)]
    pub enabled_plugins: Vec<String>,
    #[serde(default)]
    pub plugin_settings: HashMap<String, Map<String, Value>>,
}

/// Write-through store for [`PersistedSettings`].
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    state: Mutex<PersistedSettings>,
}

impl SettingsStore {
    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store. A corrupt file is logged and
    /// treated as empty; it is replaced on the next mutation.
    pub fn load(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PersistedSettings>(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Ignoring corrupt settings file"
                    );
                    PersistedSettings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedSettings::default(),
            Err(e) => {
                return Err(PluginError::Settings(format!("{}: {e}", path.display())));
            }
        };

        Ok(Self { path, state: Mutex::new(state) })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifiers the user wants active, in the order they were enabled.
    pub fn enabled_plugin_ids(&self) -> Vec<String> {
        self.state.lock().enabled_plugins.clone()
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.state.lock().enabled_plugins.iter().any(|p| p == id)
    }

    /// Add `id` to the enabled-set and persist.
    pub fn enable(&self, id: &str) -> PluginResult<()> {
        let mut state = self.state.lock();
        if !state.enabled_plugins.iter().any(|p| p == id) {
            state.enabled_plugins.push(id.to_string());
        }
        self.write(&state)
    }

    /// Remove `id` from the enabled-set and persist.
    pub fn disable(&self, id: &str) -> PluginResult<()> {
        let mut state = self.state.lock();
        state.enabled_plugins.retain(|p| p != id);
        self.write(&state)
    }

    pub fn get_setting(&self, id: &str, key: &str) -> Option<Value> {
        self.state.lock().plugin_settings.get(id).and_then(|m| m.get(key)).cloned()
    }

    /// Store a setting value for a package and persist.
    pub fn set_setting(&self, id: &str, key: &str, value: Value) -> PluginResult<()> {
        let mut state = self.state.lock();
        state.plugin_settings.entry(id.to_string()).or_default().insert(key.to_string(), value);
        self.write(&state)
    }

    /// All settings of one package.
    pub fn package_settings(&self, id: &str) -> Map<String, Value> {
        self.state.lock().plugin_settings.get(id).cloned().unwrap_or_default()
    }

    /// Rewrite the file atomically: temp file in the same directory, then rename.
    fn write(&self, state: &PersistedSettings) -> PluginResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| PluginError::Settings(format!("{}: {e}", dir.display())))?;

        let content = serde_json::to_string_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| PluginError::Settings(format!("{}: {e}", dir.display())))?;
        tmp.write_all(content.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| PluginError::Settings(format!("{}: {e}", self.path.display())))?;
        tmp.persist(&self.path)
            .map_err(|e| PluginError::Settings(format!("{}: {}", self.path.display(), e.error)))?;

        tracing::debug!(path = %self.path.display(), "Settings written");
        Ok(())
    }
}
