//! Plugin runtime error types.

use thiserror::Error;

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur inside the plugin runtime.
///
/// Nothing of this type escapes the [`LifecycleCoordinator`](super::LifecycleCoordinator):
/// the coordinator turns every error into a state tag, a log line and a host
/// notification.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Package (or one of its files) not found.
    #[error("Package not found: {0}")]
    NotFound(String),

    /// Package manifest is missing a field or malformed.
    #[error("Invalid package manifest: {0}")]
    InvalidManifest(String),

    /// Package files could not be read or copied.
    #[error("Failed to load package: {0}")]
    LoadError(String),

    /// Guest code threw during evaluation or inside a hook.
    #[error("Package execution failed: {0}")]
    ExecutionError(String),

    /// Capability used without the matching permission (strict policy only).
    #[error("Package '{package}' requires permission '{permission}' which is not granted")]
    PermissionDenied { package: String, permission: String },

    /// Guest code exceeded its wall-clock budget.
    #[error("Package '{0}' timed out after {1} ms")]
    Timeout(String, u64),

    /// A sandbox instance already exists for this package.
    #[error("Package '{0}' is already running")]
    AlreadyRunning(String),

    /// Package is tagged `error` and cannot be activated.
    #[error("Package '{package}' is in error state: {reason}")]
    Errored { package: String, reason: String },

    /// The engine thread is gone or stopped answering.
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Settings file could not be read or written.
    #[error("Settings error: {0}")]
    Settings(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    /// Whether this error came from a wall-clock timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(..))
    }
}
