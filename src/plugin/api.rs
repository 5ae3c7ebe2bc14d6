//! Capability-scoped API handed to packages, and the registries behind it.
//!
//! Every package gets its own [`CapabilityApi`]. Each call checks the
//! package's declared permissions first; a missing permission turns the call
//! into a logged no-op under [`PermissionPolicy::Lenient`] or an error under
//! [`PermissionPolicy::Strict`]. Registrations land in the process-wide
//! [`CapabilityRegistry`], partitioned by package identifier.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::manifest::PackageManifest;
use super::{
    DocumentInfo, HostEvent, HostNotifier, LoadedPackage, LogLevel, MenuItem, PackageState,
    Permission, PermissionSet, PluginError, PluginResult, SettingsStore, Severity,
};

/// What happens when a package uses a capability it did not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    /// Log a warning and do nothing.
    #[default]
    Lenient,
    /// Fail the call; guest code sees an exception.
    Strict,
}

/// Handler behind a registered command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn invoke(&self) -> Result<(), String>;
}

/// Subscriber to document changes.
#[async_trait]
pub trait DocumentListener: Send + Sync {
    async fn on_change(&self, document: Option<DocumentInfo>) -> Result<(), String>;
}

/// Adapts a plain closure into a [`CommandHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    async fn invoke(&self) -> Result<(), String> {
        (self.0)()
    }
}

/// Adapts a plain closure into a [`DocumentListener`].
pub struct FnListener<F>(pub F);

#[async_trait]
impl<F> DocumentListener for FnListener<F>
where
    F: Fn(Option<DocumentInfo>) -> Result<(), String> + Send + Sync,
{
    async fn on_change(&self, document: Option<DocumentInfo>) -> Result<(), String> {
        (self.0)(document)
    }
}

/// Identifier of one document-change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ListenerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Default)]
struct RegistryState {
    /// package id → fully-qualified command id → handler
    commands: HashMap<String, HashMap<String, Arc<dyn CommandHandler>>>,
    menus: HashMap<String, Vec<MenuItem>>,
    listeners: HashMap<String, Vec<(ListenerId, Arc<dyn DocumentListener>)>>,
    current_document: Option<DocumentInfo>,
    next_listener: u64,
}

/// Process-wide registries of commands, menu items, document listeners and settings.
pub struct CapabilityRegistry {
    state: Mutex<RegistryState>,
    settings: Arc<SettingsStore>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CapabilityRegistry")
            .field("packages_with_commands", &state.commands.len())
            .field("packages_with_menus", &state.menus.len())
            .field("packages_with_listeners", &state.listeners.len())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { state: Mutex::new(RegistryState::default()), settings }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    fn insert_command(
        &self,
        package_id: &str,
        command_id: String,
        handler: Arc<dyn CommandHandler>,
    ) {
        let mut state = self.state.lock();
        let table = state.commands.entry(package_id.to_string()).or_default();
        if table.insert(command_id.clone(), handler).is_some() {
            tracing::debug!(
                package = %package_id,
                command = %command_id,
                "Command handler replaced"
            );
        }
    }

    /// Fully-qualified command ids registered by one package, sorted.
    pub fn command_ids(&self, package_id: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .commands
            .get(package_id)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn has_command(&self, command_id: &str) -> bool {
        self.find_command(command_id).is_some()
    }

    fn find_command(&self, command_id: &str) -> Option<Arc<dyn CommandHandler>> {
        let state = self.state.lock();
        state.commands.values().find_map(|table| table.get(command_id).cloned())
    }

    /// Run the handler registered under a fully-qualified id.
    ///
    /// Returns `true` only if a handler was found and completed without error.
    pub async fn execute_command(&self, command_id: &str) -> bool {
        let Some(handler) = self.find_command(command_id) else {
            tracing::warn!(command = %command_id, "Command not found");
            return false;
        };

        match handler.invoke().await {
            Ok(()) => {
                tracing::debug!(command = %command_id, "Command executed");
                true
            }
            Err(e) => {
                tracing::error!(command = %command_id, error = %e, "Command handler failed");
                false
            }
        }
    }

    fn push_menu_item(&self, package_id: &str, item: MenuItem) {
        self.state.lock().menus.entry(package_id.to_string()).or_default().push(item);
    }

    pub fn menu_items(&self, package_id: &str) -> Vec<MenuItem> {
        self.state.lock().menus.get(package_id).cloned().unwrap_or_default()
    }

    fn add_listener(&self, package_id: &str, listener: Arc<dyn DocumentListener>) -> ListenerId {
        let mut state = self.state.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.entry(package_id.to_string()).or_default().push((id, listener));
        id
    }

    fn remove_listener(&self, package_id: &str, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let Some(list) = state.listeners.get_mut(package_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn listener_count(&self, package_id: &str) -> usize {
        self.state.lock().listeners.get(package_id).map_or(0, Vec::len)
    }

    pub fn current_document(&self) -> Option<DocumentInfo> {
        self.state.lock().current_document.clone()
    }

    /// Store the current document and notify every listener of every package.
    ///
    /// Each listener runs behind its own error boundary.
    pub async fn set_current_document(&self, document: Option<DocumentInfo>) {
        let listeners: Vec<(String, Arc<dyn DocumentListener>)> = {
            let mut state = self.state.lock();
            state.current_document = document.clone();
            state
                .listeners
                .iter()
                .flat_map(|(package, list)| {
                    list.iter().map(move |(_, listener)| (package.clone(), Arc::clone(listener)))
                })
                .collect()
        };

        for (package, listener) in listeners {
            if let Err(e) = listener.on_change(document.clone()).await {
                tracing::warn!(package = %package, error = %e, "Document listener failed");
            }
        }
    }

    /// Drop commands, menu items and listeners of one package. Settings stay.
    pub fn clear_package(&self, package_id: &str) {
        let mut state = self.state.lock();
        state.commands.remove(package_id);
        state.menus.remove(package_id);
        state.listeners.remove(package_id);
        tracing::debug!(package = %package_id, "Capability registrations cleared");
    }

    /// Drop every package's registrations.
    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.menus.clear();
        state.listeners.clear();
    }
}

/// Builds per-package capability objects and owns the shared registries.
pub struct CapabilityFactory {
    registry: Arc<CapabilityRegistry>,
    notifier: Arc<dyn HostNotifier>,
    policy: PermissionPolicy,
}

impl CapabilityFactory {
    pub fn new(
        settings: Arc<SettingsStore>,
        notifier: Arc<dyn HostNotifier>,
        policy: PermissionPolicy,
    ) -> Self {
        Self { registry: Arc::new(CapabilityRegistry::new(settings)), notifier, policy }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Build the capability object for one package.
    pub fn create_api(&self, package: &LoadedPackage) -> CapabilityApi {
        CapabilityApi {
            package_id: Arc::from(package.id()),
            permissions: Arc::new(package.permissions()),
            manifest: Arc::new(package.manifest.clone()),
            registry: Arc::clone(&self.registry),
            notifier: Arc::clone(&self.notifier),
            policy: self.policy,
        }
    }

    /// Forget everything a package registered, except its settings.
    pub fn clear_package_api(&self, package_id: &str) {
        self.registry.clear_package(package_id);
    }

    pub async fn execute_command(&self, command_id: &str) -> bool {
        self.registry.execute_command(command_id).await
    }

    pub async fn set_current_document(&self, document: Option<DocumentInfo>) {
        self.registry.set_current_document(document).await;
    }
}

/// The operations one package may perform, bound to its identity and permissions.
#[derive(Clone)]
pub struct CapabilityApi {
    package_id: Arc<str>,
    permissions: Arc<PermissionSet>,
    manifest: Arc<PackageManifest>,
    registry: Arc<CapabilityRegistry>,
    notifier: Arc<dyn HostNotifier>,
    policy: PermissionPolicy,
}

impl fmt::Debug for CapabilityApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityApi")
            .field("package_id", &self.package_id)
            .field("permissions", &self.permissions)
            .field("policy", &self.policy)
            .finish()
    }
}

impl CapabilityApi {
    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Withdraw the package after the sandbox stopped it on its own.
    ///
    /// Registrations are dropped and the host is told why. Settings stay.
    pub(crate) fn revoke(&self, reason: &str) {
        self.registry.clear_package(&self.package_id);
        let id = self.package_id.to_string();
        self.notifier
            .notify(HostEvent::StateChanged { id: id.clone(), state: PackageState::Error });
        self.notifier.notify(HostEvent::Error { id, message: reason.to_string() });
    }

    /// `Ok(true)` if granted, `Ok(false)` for a lenient denial.
    fn check(&self, permission: Permission, operation: &str) -> PluginResult<bool> {
        if self.permissions.contains(permission) {
            return Ok(true);
        }

        tracing::warn!(
            package = %self.package_id,
            permission = %permission,
            operation,
            "Capability call denied: permission not declared"
        );

        match self.policy {
            PermissionPolicy::Lenient => Ok(false),
            PermissionPolicy::Strict => Err(PluginError::PermissionDenied {
                package: self.package_id.to_string(),
                permission: permission.to_string(),
            }),
        }
    }

    fn qualify(&self, local_id: &str) -> String {
        format!("{}.{}", self.package_id, local_id)
    }

    /// Register a command under `<package>.<local_id>`.
    pub fn register_command(
        &self,
        local_id: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> PluginResult<bool> {
        if !self.check(Permission::Commands, "registerCommand")? {
            return Ok(false);
        }

        let command_id = self.qualify(local_id);
        tracing::debug!(package = %self.package_id, command = %command_id, "Command registered");
        self.registry.insert_command(&self.package_id, command_id, handler);
        Ok(true)
    }

    /// Contribute a menu item. Its command reference is qualified with the package id.
    pub fn register_menu_item(&self, mut item: MenuItem) -> PluginResult<bool> {
        if !self.check(Permission::Menus, "registerMenuItem")? {
            return Ok(false);
        }

        item.command = self.qualify(&item.command);
        self.registry.push_menu_item(&self.package_id, item.clone());
        self.notifier.notify(HostEvent::MenuItemAdded { id: self.package_id.to_string(), item });
        Ok(true)
    }

    pub fn show_notification(&self, message: &str, severity: Severity) -> PluginResult<bool> {
        if !self.check(Permission::Notifications, "showNotification")? {
            return Ok(false);
        }

        self.notifier.notify(HostEvent::Notification {
            id: self.package_id.to_string(),
            message: message.to_string(),
            severity,
        });
        Ok(true)
    }

    /// Document access, present only with the `document:read` permission.
    pub fn document(&self) -> Option<DocumentAccess<'_>> {
        self.permissions.contains(Permission::DocumentRead).then_some(DocumentAccess { api: self })
    }

    /// Read a setting, falling back to the manifest's declared default.
    pub fn get_setting(&self, key: &str) -> Option<Value> {
        self.registry
            .settings()
            .get_setting(&self.package_id, key)
            .or_else(|| self.manifest.setting_default(key).cloned())
    }

    /// Write a setting through to the settings file.
    pub fn set_setting(&self, key: &str, value: Value) -> PluginResult<bool> {
        if !self.check(Permission::Settings, "setSetting")? {
            return Ok(false);
        }

        self.registry.settings().set_setting(&self.package_id, key, value)?;
        Ok(true)
    }

    /// Log on behalf of the package.
    pub fn log(&self, message: &str, level: LogLevel) {
        let package = &*self.package_id;
        match level {
            LogLevel::Debug => tracing::debug!(target: "folio::package", package, "{}", message),
            LogLevel::Info => tracing::info!(target: "folio::package", package, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "folio::package", package, "{}", message),
            LogLevel::Error => tracing::error!(target: "folio::package", package, "{}", message),
        }
    }
}

/// Document operations of a package holding `document:read`.
#[derive(Debug, Clone, Copy)]
pub struct DocumentAccess<'a> {
    api: &'a CapabilityApi,
}

impl DocumentAccess<'_> {
    pub fn current(&self) -> Option<DocumentInfo> {
        self.api.registry.current_document()
    }

    /// Subscribe to document changes.
    pub fn on_change(&self, listener: Arc<dyn DocumentListener>) -> Subscription {
        let id = self.api.registry.add_listener(&self.api.package_id, listener);
        Subscription {
            id,
            package_id: Arc::clone(&self.api.package_id),
            registry: Arc::clone(&self.api.registry),
        }
    }

    /// Remove a listener by id.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.api.registry.remove_listener(&self.api.package_id, id)
    }
}

/// Returned by [`DocumentAccess::on_change`]; removes exactly that listener.
pub struct Subscription {
    id: ListenerId,
    package_id: Arc<str>,
    registry: Arc<CapabilityRegistry>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn unsubscribe(&self) -> bool {
        self.registry.remove_listener(&self.package_id, self.id)
    }
}
