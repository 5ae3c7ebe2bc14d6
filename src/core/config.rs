//! Configuration management for Folio.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::{PermissionPolicy, RuntimeOptions, SandboxConfig, SETTINGS_FILE};

/// Environment variable overriding the user-data directory.
pub const DATA_DIR_ENV: &str = "FOLIO_DATA_DIR";

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Package runtime settings
    pub plugins: PluginsConfig,

    /// Guest code limits
    pub sandbox: SandboxSettings,
}

/// General application settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// User-data directory. `~` and `$VAR` are expanded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// Package runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Packages root (defaults to `<data_dir>/plugins`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages_dir: Option<String>,

    /// Settings file, relative to the data directory unless absolute
    pub settings_file: String,

    /// What a capability call without permission does
    pub permission_policy: PermissionPolicy,
}

/// Limits applied to guest code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub execution_timeout_ms: u64,
    pub activation_timeout_ms: u64,
    pub deactivation_timeout_ms: u64,
    pub callback_timeout_ms: u64,
    pub max_timer_delay_ms: u64,
    pub min_timer_interval_ms: u64,
    pub max_timers: u32,
    pub memory_limit_mb: u64,
    pub tick_ms: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            packages_dir: None,
            settings_file: SETTINGS_FILE.to_string(),
            permission_policy: PermissionPolicy::default(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 5_000,
            activation_timeout_ms: 10_000,
            deactivation_timeout_ms: 5_000,
            callback_timeout_ms: 5_000,
            max_timer_delay_ms: 60_000,
            min_timer_interval_ms: 100,
            max_timers: 64,
            memory_limit_mb: 64,
            tick_ms: 20,
        }
    }
}

impl SandboxSettings {
    /// Runtime form of these settings.
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            execution_timeout: Duration::from_millis(self.execution_timeout_ms),
            activation_timeout: Duration::from_millis(self.activation_timeout_ms),
            deactivation_timeout: Duration::from_millis(self.deactivation_timeout_ms),
            callback_timeout: Duration::from_millis(self.callback_timeout_ms),
            max_timer_delay: Duration::from_millis(self.max_timer_delay_ms),
            min_timer_interval: Duration::from_millis(self.min_timer_interval_ms),
            max_timers: self.max_timers,
            memory_limit: usize::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024))
                .unwrap_or(usize::MAX),
            tick: Duration::from_millis(self.tick_ms.max(1)),
        }
    }
}

/// Expand `~` and environment variables in a configured path.
fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::warn!(path = raw, error = %e, "Could not expand path, using it verbatim");
            PathBuf::from(raw)
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for `~/.config/folio/config.toml` and falls back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit path when given, the default location otherwise.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the global config file.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        self.save_to(&path)
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("folio"))
    }

    /// Default config file location.
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("config.toml"))
    }

    /// Default user-data directory.
    pub fn default_data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("folio"))
    }

    /// User-data directory: explicit override, then `FOLIO_DATA_DIR`, then
    /// `[general] data_dir`, then the platform default.
    pub fn data_dir(&self, override_dir: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(dir) = override_dir {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = self.general.data_dir.as_deref() {
            return Ok(expand_path(dir));
        }
        Self::default_data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
    }

    /// Packages root for a given data directory.
    pub fn packages_dir(&self, data_dir: &Path) -> PathBuf {
        self.plugins
            .packages_dir
            .as_deref()
            .map_or_else(|| data_dir.join("plugins"), expand_path)
    }

    /// Settings file for a given data directory.
    pub fn settings_path(&self, data_dir: &Path) -> PathBuf {
        let file = expand_path(&self.plugins.settings_file);
        if file.is_absolute() {
            file
        } else {
            data_dir.join(file)
        }
    }

    /// Everything the package runtime needs.
    pub fn runtime_options(&self, data_dir: &Path) -> RuntimeOptions {
        RuntimeOptions {
            packages_dir: self.packages_dir(data_dir),
            settings_file: self.settings_path(data_dir),
            sandbox: self.sandbox.to_sandbox_config(),
            permission_policy: self.plugins.permission_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.general.data_dir.is_none());
        assert_eq!(config.plugins.settings_file, "plugin-settings.json");
        assert_eq!(config.plugins.permission_policy, PermissionPolicy::Lenient);
        assert_eq!(config.sandbox.execution_timeout_ms, 5_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[plugins]"));
        assert!(toml_str.contains("[sandbox]"));
        assert!(toml_str.contains("permission_policy = \"lenient\""));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [plugins]
            permission_policy = "strict"
            packages_dir = "/opt/folio/packages"

            [sandbox]
            execution_timeout_ms = 250
            memory_limit_mb = 16
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins.permission_policy, PermissionPolicy::Strict);
        assert_eq!(config.sandbox.execution_timeout_ms, 250);
        assert_eq!(config.sandbox.deactivation_timeout_ms, 5_000);

        let sandbox = config.sandbox.to_sandbox_config();
        assert_eq!(sandbox.execution_timeout, Duration::from_millis(250));
        assert_eq!(sandbox.memory_limit, 16 * 1024 * 1024);

        let data_dir = Path::new("/data");
        assert_eq!(config.packages_dir(data_dir), PathBuf::from("/opt/folio/packages"));
        assert_eq!(config.settings_path(data_dir), PathBuf::from("/data/plugin-settings.json"));
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[plugins]\npermission_policy = \"yolo\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.sandbox.max_timers = 8;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from_file(&path).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_data_dir_precedence() {
        let config = Config {
            general: GeneralConfig { data_dir: Some("/from/config".to_string()) },
            ..Config::default()
        };

        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(config.data_dir(None).unwrap(), PathBuf::from("/from/config"));

        std::env::set_var(DATA_DIR_ENV, "/from/env");
        assert_eq!(config.data_dir(None).unwrap(), PathBuf::from("/from/env"));
        assert_eq!(
            config.data_dir(Some(Path::new("/from/flag"))).unwrap(),
            PathBuf::from("/from/flag")
        );
        std::env::remove_var(DATA_DIR_ENV);
    }

    #[test]
    #[serial]
    fn test_data_dir_expands_variables() {
        std::env::remove_var(DATA_DIR_ENV);
        std::env::set_var("FOLIO_TEST_ROOT", "/srv");
        let config = Config {
            general: GeneralConfig { data_dir: Some("$FOLIO_TEST_ROOT/folio".to_string()) },
            ..Config::default()
        };
        assert_eq!(config.data_dir(None).unwrap(), PathBuf::from("/srv/folio"));
        std::env::remove_var("FOLIO_TEST_ROOT");
    }
}
