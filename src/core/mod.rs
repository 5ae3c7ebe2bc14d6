//! Core application plumbing for Folio.
//!
//! Holds configuration shared by the library and the `folio` binary.

mod config;

pub use config::{Config, GeneralConfig, PluginsConfig, SandboxSettings, DATA_DIR_ENV};
