//! Package manifest parsing and validation.
//!
//! A package manifest is a `manifest.json` file at the root of the package
//! directory that names the package, its entry point and the capabilities it
//! needs. Validation runs on the raw JSON value so that the first offending
//! field can be reported before any typed parsing happens.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PermissionSet, PluginError, PluginResult};

/// Required string fields, in the order they are checked.
const REQUIRED_STRING_FIELDS: [&str; 6] =
    ["id", "name", "version", "main", "author", "description"];

/// First problem found in a raw manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Offending field, empty when the manifest is not an object at all.
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Validate an untyped manifest.
///
/// Returns the first violated field, or `None` when the manifest satisfies the
/// schema. Pure: no I/O.
pub fn validate(raw: &Value) -> Option<ValidationError> {
    let Some(object) = raw.as_object() else {
        return Some(ValidationError {
            field: "",
            message: "Manifest must be a JSON object".to_string(),
        });
    };

    for field in REQUIRED_STRING_FIELDS {
        match object.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => {
                return Some(ValidationError {
                    field,
                    message: format!("Manifest field '{field}' must not be empty"),
                });
            }
            _ => {
                return Some(ValidationError {
                    field,
                    message: format!("Manifest field '{field}' is missing or not a string"),
                });
            }
        }
    }

    if !matches!(object.get("permissions"), Some(Value::Array(_))) {
        return Some(ValidationError {
            field: "permissions",
            message: "Manifest field 'permissions' is missing or not an array".to_string(),
        });
    }

    None
}

/// Typed package manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    /// Unique package identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    pub description: String,
    pub author: String,
    /// Entry point, relative to the package directory.
    pub main: String,
    /// Declared capability tags.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Icon path, relative to the package directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Optional UI contributions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributes: Option<Contributions>,
}

/// UI contributions declared up front in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contributions {
    #[serde(default)]
    pub settings: Vec<SettingDeclaration>,
}

/// A setting the package declares, with its default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDeclaration {
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

impl PackageManifest {
    /// Validate and parse a raw manifest value.
    pub fn from_value(raw: Value) -> PluginResult<Self> {
        if let Some(err) = validate(&raw) {
            return Err(PluginError::InvalidManifest(err.message));
        }
        serde_json::from_value(raw).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Stand-in manifest for a directory whose own manifest could not be used.
    ///
    /// The id is always the directory name. Other string fields the raw
    /// manifest did carry are kept so the host can still show something
    /// meaningful next to the error.
    pub fn placeholder(dir_name: &str, raw: Option<&Value>) -> Self {
        let field = |key: &str| {
            raw.and_then(|v| v.get(key))
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };

        Self {
            id: dir_name.to_string(),
            name: field("name").unwrap_or_else(|| dir_name.to_string()),
            version: field("version").unwrap_or_else(|| "0.0.0".to_string()),
            description: field("description").unwrap_or_default(),
            author: field("author").unwrap_or_default(),
            main: field("main").unwrap_or_default(),
            permissions: Vec::new(),
            icon: field("icon"),
            contributes: None,
        }
    }

    /// Granted permissions.
    pub fn permission_set(&self) -> PermissionSet {
        PermissionSet::from_tags(&self.permissions)
    }

    /// Absolute path of the entry point for a package rooted at `dir`.
    pub fn entry_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.main)
    }

    /// Default value declared for a setting key.
    pub fn setting_default(&self, key: &str) -> Option<&Value> {
        self.contributes
            .as_ref()?
            .settings
            .iter()
            .find(|s| s.key == key)
            .and_then(|s| s.default.as_ref())
    }
}
