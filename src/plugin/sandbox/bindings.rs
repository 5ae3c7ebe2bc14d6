//! Host functions exposed to the guest prelude, and the registry proxies that
//! call back into guest code.
//!
//! Only strings and booleans cross the boundary. Structured values travel as
//! JSON; fallible calls answer with a JSON envelope
//! `{"status": "ok" | "skipped" | "error", ...}` that the prelude unwraps.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rquickjs::{Ctx, Function, Object};
use serde_json::{json, Value};
use url::Url;

use super::require::{self, ResolvedModule};
use super::{call_guest, EngineRequest, GuestCall};
use crate::plugin::{
    CapabilityApi, CommandHandler, DocumentInfo, DocumentListener, ListenerId, LogLevel, MenuItem,
    Permission, PluginResult, Severity,
};

/// Everything the host functions of one package context need.
pub(super) struct Bridge {
    pub package_id: String,
    pub root: PathBuf,
    pub api: CapabilityApi,
    pub requests: Sender<EngineRequest>,
    pub callback_timeout: Duration,
    pub revoked: Arc<AtomicBool>,
}

fn ok(value: Value) -> String {
    json!({ "status": "ok", "value": value }).to_string()
}

fn fail(message: impl std::fmt::Display) -> String {
    json!({ "status": "error", "message": message.to_string() }).to_string()
}

fn reply(result: PluginResult<bool>) -> String {
    match result {
        Ok(true) => ok(Value::Bool(true)),
        Ok(false) => json!({ "status": "skipped" }).to_string(),
        Err(e) => fail(e),
    }
}

impl Bridge {
    fn live(&self) -> Result<(), String> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(fail(format!("Package '{}' is no longer running", self.package_id)));
        }
        Ok(())
    }

    fn log(&self, level: &str, message: &str) {
        self.api.log(message, LogLevel::parse_lenient(level));
    }

    fn has_permission(&self, tag: &str) -> bool {
        tag.parse::<Permission>().is_ok_and(|p| self.api.has_permission(p))
    }

    fn require(&self, from_dir: &str, specifier: &str) -> String {
        let resolved = match require::resolve(&self.root, Path::new(from_dir), specifier) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(
                    package = %self.package_id,
                    specifier,
                    error = %e,
                    "Require refused"
                );
                return fail(e);
            }
        };

        let (kind, path) = match resolved {
            ResolvedModule::Builtin(name) => {
                return ok(json!({ "kind": "builtin", "name": name }));
            }
            ResolvedModule::Script(path) => ("script", path),
            ResolvedModule::Json(path) => ("json", path),
        };

        match std::fs::read_to_string(&path) {
            Ok(source) => ok(json!({
                "kind": kind,
                "path": path.to_string_lossy(),
                "dirname": path.parent().unwrap_or(&self.root).to_string_lossy(),
                "source": source,
            })),
            Err(e) => fail(format!("Cannot read module '{specifier}': {e}")),
        }
    }

    fn register_command(&self, local_id: String) -> String {
        if let Err(revoked) = self.live() {
            return revoked;
        }
        let handler = Arc::new(JsCommandHandler {
            package_id: self.package_id.clone(),
            local_id: local_id.clone(),
            requests: self.requests.clone(),
            timeout: self.callback_timeout,
        });
        reply(self.api.register_command(&local_id, handler))
    }

    fn register_menu_item(&self, raw: &str) -> String {
        if let Err(revoked) = self.live() {
            return revoked;
        }
        match serde_json::from_str::<MenuItem>(raw) {
            Ok(item) => reply(self.api.register_menu_item(item)),
            Err(e) => fail(format!("Invalid menu item: {e}")),
        }
    }

    fn show_notification(&self, message: &str, severity: &str) -> String {
        if let Err(revoked) = self.live() {
            return revoked;
        }
        reply(self.api.show_notification(message, Severity::parse_lenient(severity)))
    }

    fn get_setting(&self, key: &str) -> Option<String> {
        self.api.get_setting(key).map(|value| value.to_string())
    }

    fn set_setting(&self, key: &str, raw: &str) -> String {
        if let Err(revoked) = self.live() {
            return revoked;
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => reply(self.api.set_setting(key, value)),
            Err(e) => fail(format!("Setting value is not serializable: {e}")),
        }
    }

    fn current_document(&self) -> Option<String> {
        let document = self.api.document()?.current()?;
        serde_json::to_string(&document).ok()
    }

    fn subscribe_document(&self, listener: String) -> String {
        if let Err(revoked) = self.live() {
            return revoked;
        }
        let Some(access) = self.api.document() else {
            return fail("Permission 'document:read' is not granted");
        };
        let proxy = Arc::new(JsDocumentListener {
            package_id: self.package_id.clone(),
            listener,
            requests: self.requests.clone(),
            timeout: self.callback_timeout,
        });
        ok(Value::String(access.on_change(proxy).id().to_string()))
    }

    fn unsubscribe_document(&self, id: &str) -> bool {
        let Ok(id) = id.parse::<ListenerId>() else {
            return false;
        };
        self.api.document().is_some_and(|access| access.unsubscribe(id))
    }
}

/// Parse a URL the way the guest `URL` constructor expects.
fn parse_url(input: &str, base: Option<&str>) -> String {
    let parsed = match base {
        Some(base) => Url::parse(base).and_then(|base| base.join(input)),
        None => Url::parse(input),
    };

    match parsed {
        Ok(url) => {
            let hostname = url.host_str().unwrap_or_default().to_string();
            let port = url.port().map(|p| p.to_string()).unwrap_or_default();
            let host =
                if port.is_empty() { hostname.clone() } else { format!("{hostname}:{port}") };
            ok(json!({
                "href": url.as_str(),
                "origin": url.origin().ascii_serialization(),
                "protocol": format!("{}:", url.scheme()),
                "username": url.username(),
                "password": url.password().unwrap_or_default(),
                "host": host,
                "hostname": hostname,
                "port": port,
                "pathname": url.path(),
                "search": url.query().map(|q| format!("?{q}")).unwrap_or_default(),
                "hash": url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
            }))
        }
        Err(e) => fail(e),
    }
}

/// Build the host object handed to the prelude's bootstrap function.
pub(super) fn host_object<'js>(ctx: &Ctx<'js>, bridge: Bridge) -> rquickjs::Result<Object<'js>> {
    let bridge = Rc::new(bridge);
    let host = Object::new(ctx.clone())?;

    let b = Rc::clone(&bridge);
    let log = move |level: String, message: String| b.log(&level, &message);
    host.set("log", Function::new(ctx.clone(), log)?)?;

    let b = Rc::clone(&bridge);
    let has_permission = move |tag: String| b.has_permission(&tag);
    host.set("hasPermission", Function::new(ctx.clone(), has_permission)?)?;

    let b = Rc::clone(&bridge);
    let require = move |from_dir: String, specifier: String| b.require(&from_dir, &specifier);
    host.set("require", Function::new(ctx.clone(), require)?)?;

    let b = Rc::clone(&bridge);
    let register_command = move |local_id: String| b.register_command(local_id);
    host.set("registerCommand", Function::new(ctx.clone(), register_command)?)?;

    let b = Rc::clone(&bridge);
    let register_menu_item = move |raw: String| b.register_menu_item(&raw);
    host.set("registerMenuItem", Function::new(ctx.clone(), register_menu_item)?)?;

    let b = Rc::clone(&bridge);
    let show_notification =
        move |message: String, severity: String| b.show_notification(&message, &severity);
    host.set("showNotification", Function::new(ctx.clone(), show_notification)?)?;

    let b = Rc::clone(&bridge);
    let get_setting = move |key: String| b.get_setting(&key);
    host.set("getSetting", Function::new(ctx.clone(), get_setting)?)?;

    let b = Rc::clone(&bridge);
    let set_setting = move |key: String, raw: String| b.set_setting(&key, &raw);
    host.set("setSetting", Function::new(ctx.clone(), set_setting)?)?;

    let b = Rc::clone(&bridge);
    let current_document = move || b.current_document();
    host.set("currentDocument", Function::new(ctx.clone(), current_document)?)?;

    let b = Rc::clone(&bridge);
    let subscribe = move |key: String| b.subscribe_document(key);
    host.set("subscribeDocument", Function::new(ctx.clone(), subscribe)?)?;

    let b = Rc::clone(&bridge);
    let unsubscribe = move |id: String| b.unsubscribe_document(&id);
    host.set("unsubscribeDocument", Function::new(ctx.clone(), unsubscribe)?)?;

    let parse = |input: String, base: Option<String>| parse_url(&input, base.as_deref());
    host.set("parseUrl", Function::new(ctx.clone(), parse)?)?;

    Ok(host)
}

/// Registry entry for a command whose handler is a guest function.
struct JsCommandHandler {
    package_id: String,
    local_id: String,
    requests: Sender<EngineRequest>,
    timeout: Duration,
}

#[async_trait]
impl CommandHandler for JsCommandHandler {
    async fn invoke(&self) -> Result<(), String> {
        let call = GuestCall::Command(self.local_id.clone());
        call_guest(&self.requests, &self.package_id, call, self.timeout)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Registry entry for a document listener that is a guest function.
struct JsDocumentListener {
    package_id: String,
    listener: String,
    requests: Sender<EngineRequest>,
    timeout: Duration,
}

#[async_trait]
impl DocumentListener for JsDocumentListener {
    async fn on_change(&self, document: Option<DocumentInfo>) -> Result<(), String> {
        let call = GuestCall::Document { listener: self.listener.clone(), document };
        call_guest(&self.requests, &self.package_id, call, self.timeout)
            .await
            .map_err(|e| e.to_string())
    }
}
