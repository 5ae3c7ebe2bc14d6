//! Sandbox Integration Tests
//!
//! Exercises module resolution, timers and isolation of guest code through
//! the public sandbox API.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use folio::plugin::{
    CapabilityFactory, LogNotifier, PackageLoader, PermissionPolicy, PluginError, Sandbox,
    SandboxConfig, SettingsStore,
};
use tempfile::TempDir;

struct Fixture {
    _temp_dir: TempDir,
    loader: PackageLoader,
    factory: CapabilityFactory,
    sandbox: Sandbox,
}

fn config() -> SandboxConfig {
    SandboxConfig {
        execution_timeout: Duration::from_millis(400),
        activation_timeout: Duration::from_millis(400),
        deactivation_timeout: Duration::from_millis(400),
        callback_timeout: Duration::from_millis(400),
        ..SandboxConfig::default()
    }
}

/// One package named `pkg` with the given files (`index.js` is the entry).
fn fixture(permissions: &str, files: &[(&str, &str)]) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("plugins");
    let dir = root.join("pkg");
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = serde_json::json!({
        "id": "pkg",
        "name": "Pkg",
        "version": "1.0.0",
        "main": "index.js",
        "author": "A",
        "description": "D",
        "permissions": serde_json::from_str::<serde_json::Value>(permissions).unwrap(),
    })
    .to_string();
    std::fs::write(dir.join("manifest.json"), manifest).unwrap();
    for (name, content) in files {
        write(&dir, name, content);
    }
    std::fs::write(temp_dir.path().join("secrets.js"), "module.exports = 'top secret';").unwrap();

    let mut loader = PackageLoader::new(root).unwrap();
    loader.discover();
    let settings = Arc::new(SettingsStore::load(temp_dir.path().join("settings.json")).unwrap());
    let factory =
        CapabilityFactory::new(settings, Arc::new(LogNotifier), PermissionPolicy::Lenient);
    let sandbox = Sandbox::spawn(config()).unwrap();
    Fixture { _temp_dir: temp_dir, loader, factory, sandbox }
}

fn write(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

impl Fixture {
    async fn start(&mut self) -> Result<(), PluginError> {
        let package = self.loader.get("pkg").unwrap().clone();
        let api = self.factory.create_api(&package);
        self.sandbox.execute(&package, api).await?;
        self.sandbox.activate("pkg").await
    }

    fn setting(&self, key: &str) -> Option<serde_json::Value> {
        self.factory.registry().settings().get_setting("pkg", key)
    }
}

// ============================================================================
// Module resolution
// ============================================================================

#[tokio::test]
async fn test_require_host_module_not_allowed() {
    let mut fx = fixture("[]", &[("index.js", "const fs = require('fs');")]);

    let err = fx.start().await.unwrap_err();
    assert!(err.to_string().contains("Module not allowed: fs"), "{err}");
    assert!(!fx.sandbox.is_running("pkg"));
}

#[tokio::test]
async fn test_require_outside_package_rejected() {
    let mut fx = fixture("[]", &[("index.js", "require('../../secrets.js');")]);

    let err = fx.start().await.unwrap_err();
    assert!(err.to_string().contains("Cannot require outside plugin directory"), "{err}");
}

#[tokio::test]
async fn test_require_missing_module() {
    let mut fx = fixture("[]", &[("index.js", "require('./nope');")]);

    let err = fx.start().await.unwrap_err();
    assert!(err.to_string().contains("Cannot find module './nope'"), "{err}");
}

#[tokio::test]
async fn test_require_relative_json_and_builtins() {
    let mut fx = fixture(
        r#"["settings"]"#,
        &[
            (
                "index.js",
                r#"
                const path = require('path');
                const { EventEmitter } = require('node:events');
                const data = require('./data/config.json');
                const helper = require('./lib');
                const again = require('./lib/index.js');

                exports.activate = (api) => {
                    const bus = new EventEmitter();
                    bus.on('ping', (v) => api.setSetting('ping', v));
                    bus.emit('ping', data.greeting);
                    api.setSetting('joined', path.join('a', '..', 'b', 'c.pdf'));
                    api.setSetting('sameModule', helper === again);
                    api.setSetting('helper', helper.twice(21));
                };
                "#,
            ),
            ("data/config.json", r#"{"greeting":"hello"}"#),
            ("lib/index.js", "exports.twice = (n) => n * 2;"),
        ],
    );

    fx.start().await.unwrap();
    assert_eq!(fx.setting("ping"), Some(serde_json::json!("hello")));
    assert_eq!(fx.setting("joined"), Some(serde_json::json!("b/c.pdf")));
    assert_eq!(fx.setting("sameModule"), Some(serde_json::json!(true)));
    assert_eq!(fx.setting("helper"), Some(serde_json::json!(42)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_require_through_symlink_rejected() {
    let mut fx = fixture("[]", &[("index.js", "require('./escape.js');")]);
    let package_dir = fx.loader.get("pkg").unwrap().path.clone();
    let secrets = package_dir.parent().unwrap().parent().unwrap().join("secrets.js");
    std::os::unix::fs::symlink(secrets, package_dir.join("escape.js")).unwrap();

    let err = fx.start().await.unwrap_err();
    assert!(err.to_string().contains("Cannot require outside plugin directory"), "{err}");
}

// ============================================================================
// Timers and isolation
// ============================================================================

#[tokio::test]
async fn test_timers_fire_after_activation() {
    let mut fx = fixture(
        r#"["settings"]"#,
        &[(
            "index.js",
            r#"
            exports.activate = (api) => {
                setTimeout(() => api.setSetting('fired', true), 20);
                const cancelled = setTimeout(() => api.setSetting('cancelled', true), 20);
                clearTimeout(cancelled);
            };
            "#,
        )],
    );

    fx.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(fx.setting("fired"), Some(serde_json::json!(true)));
    assert_eq!(fx.setting("cancelled"), None);
}

#[tokio::test]
async fn test_timers_stop_when_package_stops() {
    let mut fx = fixture(
        r#"["settings"]"#,
        &[(
            "index.js",
            r#"
            exports.activate = (api) => {
                setTimeout(() => api.setSetting('late', true), 150);
            };
            "#,
        )],
    );

    fx.start().await.unwrap();
    assert!(fx.sandbox.stop("pkg").await);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(fx.setting("late"), None);
}

#[tokio::test]
async fn test_globals_are_restricted() {
    let mut fx = fixture(
        r#"["settings"]"#,
        &[(
            "index.js",
            r#"
            exports.activate = (api) => {
                api.setSetting('globals', {
                    process: typeof process,
                    fetch: typeof fetch,
                    eval: typeof eval,
                    Function: typeof Function,
                    console: typeof console,
                    url: new URL('/doc?page=2', 'https://example.com/a/').href,
                    internals: Object.getOwnPropertyNames(globalThis)
                        .filter((name) => name.startsWith('__')),
                });
            };
            "#,
        )],
    );

    fx.start().await.unwrap();
    let globals = fx.setting("globals").unwrap();
    assert_eq!(globals["process"], "undefined");
    assert_eq!(globals["fetch"], "undefined");
    assert_eq!(globals["eval"], "undefined");
    assert_eq!(globals["console"], "object");
    assert_eq!(globals["url"], "https://example.com/doc?page=2");
    assert_eq!(globals["internals"], serde_json::json!([]));
}

#[tokio::test]
async fn test_packages_do_not_share_globals() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("plugins");
    for (id, source) in [
        ("first", "globalThis.shared = 'first'; exports.activate = () => {};"),
        (
            "second",
            "exports.activate = (api) => { api.setSetting('seen', typeof globalThis.shared); };",
        ),
    ] {
        let dir = root.join(id);
        let manifest = serde_json::json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "main": "index.js",
            "author": "A",
            "description": "D",
            "permissions": ["settings"],
        })
        .to_string();
        write(&dir, "manifest.json", &manifest);
        write(&dir, "index.js", source);
    }

    let mut loader = PackageLoader::new(root).unwrap();
    loader.discover();
    let settings = Arc::new(SettingsStore::load(temp_dir.path().join("settings.json")).unwrap());
    let factory =
        CapabilityFactory::new(settings.clone(), Arc::new(LogNotifier), PermissionPolicy::Lenient);
    let mut sandbox = Sandbox::spawn(config()).unwrap();

    for id in ["first", "second"] {
        let package = loader.get(id).unwrap();
        sandbox.execute(package, factory.create_api(package)).await.unwrap();
        sandbox.activate(id).await.unwrap();
    }

    assert_eq!(settings.get_setting("second", "seen"), Some(serde_json::json!("undefined")));
    assert_eq!(sandbox.running_ids(), vec!["first", "second"]);
}
