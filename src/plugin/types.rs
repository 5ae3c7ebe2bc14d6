//! Core plugin runtime types.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Package manifest file name.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Name of the persisted settings file inside the user-data directory.
pub const SETTINGS_FILE: &str = "plugin-settings.json";

/// Capability tag a package declares in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "document:read")]
    DocumentRead,
    #[serde(rename = "document:write")]
    DocumentWrite,
    #[serde(rename = "filesystem:read")]
    FilesystemRead,
    #[serde(rename = "filesystem:write")]
    FilesystemWrite,
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "clipboard")]
    Clipboard,
    #[serde(rename = "notifications")]
    Notifications,
    #[serde(rename = "settings")]
    Settings,
    #[serde(rename = "menus")]
    Menus,
    #[serde(rename = "commands")]
    Commands,
}

impl Permission {
    /// Every tag the runtime understands.
    pub const ALL: [Self; 10] = [
        Self::DocumentRead,
        Self::DocumentWrite,
        Self::FilesystemRead,
        Self::FilesystemWrite,
        Self::Network,
        Self::Clipboard,
        Self::Notifications,
        Self::Settings,
        Self::Menus,
        Self::Commands,
    ];

    /// The tag as written in `manifest.json`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentRead => "document:read",
            Self::DocumentWrite => "document:write",
            Self::FilesystemRead => "filesystem:read",
            Self::FilesystemWrite => "filesystem:write",
            Self::Network => "network",
            Self::Clipboard => "clipboard",
            Self::Notifications => "notifications",
            Self::Settings => "settings",
            Self::Menus => "menus",
            Self::Commands => "commands",
        }
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|permission| permission.as_str() == s)
            .ok_or_else(|| format!("unknown permission '{s}'"))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of permissions granted to one package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(HashSet<Permission>);

impl PermissionSet {
    /// Build a set from raw manifest tags, skipping tags the runtime does not know.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for tag in tags {
            match tag.as_ref().parse::<Permission>() {
                Ok(permission) => {
                    set.insert(permission);
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring permission tag"),
            }
        }
        Self(set)
    }

    /// Check whether a permission is granted.
    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    /// Number of granted permissions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Lifecycle state of a package in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    /// Discovered on disk with a valid manifest, not running.
    Installed,
    /// Running in the sandbox.
    Enabled,
    /// Deactivated by the user.
    Disabled,
    /// Bad manifest, missing entry point, or failed activation.
    Error,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Parse a guest-supplied severity, falling back to `info`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "success" => Self::Success,
            "warn" | "warning" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Log channel for package output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a guest-supplied level, falling back to `info`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Metadata of the open document, supplied by the PDF viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// The document currently open in the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub file_name: String,
    pub page_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocumentMetadata>,
}

impl DocumentInfo {
    pub fn new(file_name: impl Into<String>, page_count: u32) -> Self {
        Self { file_name: file_name.into(), page_count, metadata: None }
    }
}

/// A menu entry contributed by a package.
///
/// Once registered, `command` holds the fully-qualified command id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub label: String,
    pub command: String,
    /// Host menu to place the item in (e.g. `tools`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut: Option<String>,
}
