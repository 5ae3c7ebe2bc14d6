//! Package runtime for Folio.
//!
//! Third-party packages are directories holding a `manifest.json` and a
//! JavaScript entry point. The runtime discovers them, runs each one in its
//! own sandboxed engine context, and hands it a capability object limited
//! to the permissions its manifest declares.
//!
//! # Architecture
//!
//! - [`PackageLoader`] scans the packages root and keeps the catalog.
//! - [`Sandbox`] evaluates entry points on a dedicated engine thread.
//! - [`CapabilityFactory`] builds per-package [`CapabilityApi`] objects and
//!   owns the command, menu and document-listener registries.
//! - [`SettingsStore`] persists the enabled-set and package settings.
//! - [`LifecycleCoordinator`] drives all of the above and reports to the
//!   host UI through a [`HostNotifier`].
//!
//! # Package layout
//!
//! ```text
//! <packages>/word-count/manifest.json
//! <packages>/word-count/index.js
//! <packages>/word-count/lib/count.js
//! ```
//!
//! ```json
//! {
//!   "id": "word-count",
//!   "name": "Word Count",
//!   "version": "1.0.0",
//!   "main": "index.js",
//!   "author": "A",
//!   "description": "Counts words",
//!   "permissions": ["commands", "document:read"]
//! }
//! ```

mod api;
mod error;
mod host;
mod lifecycle;
mod loader;
pub mod manifest;
mod paths;
pub mod sandbox;
mod settings;
mod types;

pub use api::{
    CapabilityApi, CapabilityFactory, CapabilityRegistry, CommandHandler, DocumentAccess,
    DocumentListener, FnHandler, FnListener, ListenerId, PermissionPolicy, Subscription,
};
pub use error::{PluginError, PluginResult};
pub use host::{ChannelNotifier, HostEvent, HostNotifier, LogNotifier, PackageSummary};
pub use lifecycle::{LifecycleCoordinator, RuntimeOptions};
pub use loader::{is_safe_identifier, LoadedPackage, PackageLoader};
pub use manifest::{validate, PackageManifest, ValidationError};
pub use sandbox::{InstanceHandle, RunningInstance, Sandbox, SandboxConfig, SandboxFault};
pub use settings::{PersistedSettings, SettingsStore};
pub use types::{
    DocumentInfo, DocumentMetadata, LogLevel, MenuItem, PackageState, Permission, PermissionSet,
    Severity, MANIFEST_FILE, SETTINGS_FILE,
};
