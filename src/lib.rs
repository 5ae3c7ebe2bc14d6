//! # Folio
//!
//! Extension runtime for the Folio PDF editor.
//!
//! Folio discovers third-party packages on disk, validates their manifests,
//! runs their JavaScript in an isolated engine, and hands each one a
//! capability object gated by the permissions it declared.
//!
//! ## Features
//!
//! - **Manifest Validation**: Required fields, safe identifiers, known permissions
//! - **Sandboxed Execution**: One QuickJS context per package with time and memory limits
//! - **Capability API**: Commands, menu items, notifications, document access, settings
//! - **Lifecycle Management**: Install, enable, disable, uninstall, reload
//! - **Persistence**: Enabled packages and package settings survive restarts
//!
//! ## Quick Start
//!
//! ```bash
//! # Install a package and enable it
//! folio install ./word-count
//! folio enable word-count
//!
//! # Run one of its commands
//! folio exec word-count.count
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::unnecessary_debug_formatting)]
#![allow(clippy::needless_pass_by_value)]

pub mod core;
pub mod plugin;

// Re-export commonly used types
pub use crate::core::Config;
pub use plugin::{
    CapabilityApi, CapabilityFactory, HostEvent, HostNotifier, LifecycleCoordinator,
    PackageLoader, PackageManifest, PackageState, PluginError, PluginResult, RuntimeOptions,
    Sandbox, SandboxConfig, SettingsStore,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "folio";
