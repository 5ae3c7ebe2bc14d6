//! Performance benchmarks for Folio.
//!
//! This module contains benchmarks for:
//! - Manifest validation
//! - Package discovery over directories of varying size
//! - Guest `require` resolution
//! - Settings persistence
//!
//! Run with: `cargo bench`

use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use folio::plugin::sandbox::require;
use folio::plugin::{validate, PackageLoader, SettingsStore};
use serde_json::{json, Value};

// ============================================================================
// Mock Data Fixtures
// ============================================================================

mod fixtures {
    use super::*;

    /// A manifest with every field filled in.
    pub fn manifest(id: &str, permissions: &[&str]) -> Value {
        json!({
            "id": id,
            "name": format!("Package {id}"),
            "version": "1.4.2",
            "main": "index.js",
            "author": "Bench Author",
            "description": "Counts, highlights and annotates things in PDF documents",
            "permissions": permissions,
            "icon": "icon.png",
            "settings": {
                "threshold": { "type": "number", "default": 3 },
                "label": { "type": "string", "default": "words" }
            }
        })
    }

    /// Write `count` packages under `root`, every tenth one with a broken manifest.
    pub fn write_packages(root: &Path, count: usize) {
        for i in 0..count {
            let id = format!("package-{i}");
            let dir = root.join(&id);
            std::fs::create_dir_all(&dir).expect("Failed to create package dir");

            let manifest = if i % 10 == 9 {
                "{ \"id\": ".to_string()
            } else {
                manifest(&id, &["commands", "menus", "document:read"]).to_string()
            };
            std::fs::write(dir.join("manifest.json"), manifest).expect("Failed to write manifest");
            std::fs::write(dir.join("index.js"), "exports.activate = () => {};")
                .expect("Failed to write entry");
        }
    }

    /// A package tree with nested library modules.
    pub fn write_module_tree(root: &Path) {
        for dir in ["lib/strings", "lib/pdf", "data"] {
            std::fs::create_dir_all(root.join(dir)).expect("Failed to create module dir");
        }
        for file in ["index.js", "lib/count.js", "lib/strings/index.js", "lib/pdf/pages.js"] {
            std::fs::write(root.join(file), "").expect("Failed to write module");
        }
        std::fs::write(root.join("data/words.json"), "{}").expect("Failed to write data");
    }
}

// ============================================================================
// Manifest Benchmarks
// ============================================================================

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_validate");

    let cases = [
        ("valid_minimal", fixtures::manifest("word-count", &[])),
        (
            "valid_all_permissions",
            fixtures::manifest(
                "word-count",
                &[
                    "document:read",
                    "document:write",
                    "filesystem:read",
                    "filesystem:write",
                    "network",
                    "clipboard",
                    "notifications",
                    "settings",
                    "menus",
                    "commands",
                ],
            ),
        ),
        ("unsafe_id", fixtures::manifest("../escape", &["commands"])),
        ("unknown_permission", fixtures::manifest("word-count", &["commands", "root"])),
        ("missing_fields", json!({ "id": "word-count" })),
    ];

    for (name, manifest) in &cases {
        group.bench_with_input(BenchmarkId::new("validate", name), manifest, |b, manifest| {
            b.iter(|| black_box(validate(black_box(manifest))));
        });
    }

    group.finish();
}

// ============================================================================
// Discovery Benchmarks
// ============================================================================

fn bench_discover(c: &mut Criterion) {
    let mut group = c.benchmark_group("package_discovery");

    for count in [10, 50, 200].iter() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("plugins");
        fixtures::write_packages(&root, *count);
        let mut loader = PackageLoader::new(root).expect("Failed to create loader");

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("discover", count), count, |b, _| {
            b.iter(|| black_box(loader.discover().len()));
        });
    }

    group.finish();
}

// ============================================================================
// Require Resolution Benchmarks
// ============================================================================

fn bench_require_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("require_resolution");

    let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path().join("word-count");
    fixtures::write_module_tree(&root);

    let specifiers = [
        ("builtin", "path"),
        ("exact", "./lib/count.js"),
        ("extension_probe", "./lib/count"),
        ("directory_index", "./lib/strings"),
        ("json", "./data/words.json"),
        ("escape", "../../etc/passwd"),
        ("not_allowed", "child_process"),
    ];

    for (name, specifier) in specifiers {
        group.bench_function(BenchmarkId::new("resolve", name), |b| {
            b.iter(|| black_box(require::resolve(&root, &root, black_box(specifier))));
        });
    }

    group.finish();
}

// ============================================================================
// Settings Benchmarks
// ============================================================================

fn bench_settings(c: &mut Criterion) {
    let mut group = c.benchmark_group("settings");

    let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let store = SettingsStore::load(temp_dir.path().join("plugin-settings.json"))
        .expect("Failed to open settings");
    for i in 0..50 {
        store.enable(&format!("package-{i}")).expect("Failed to enable");
    }

    group.bench_function("set_setting_persisted", |b| {
        let mut n = 0_u64;
        b.iter(|| {
            n += 1;
            store.set_setting("package-1", "counter", json!(n)).expect("Failed to save");
        });
    });

    group.bench_function("get_setting", |b| {
        b.iter(|| black_box(store.get_setting(black_box("package-1"), "counter")));
    });

    group.finish();
}

// ============================================================================
// Benchmark Groups
// ============================================================================

criterion_group!(manifest_benches, bench_validate,);

criterion_group!(loader_benches, bench_discover, bench_require_resolution,);

criterion_group!(settings_benches, bench_settings,);

criterion_main!(manifest_benches, loader_benches, settings_benches,);
