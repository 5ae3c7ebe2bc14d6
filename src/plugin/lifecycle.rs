//! Lifecycle Coordinator: the one object a host UI talks to.
//!
//! Package states move `installed → enabled ⇄ disabled`; `error` is reached
//! from a bad manifest or a failed activation and is sticky until the next
//! discovery. Every public operation is an error boundary: failures become a
//! state tag, a log line and a host notification, never an `Err`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    CapabilityFactory, DocumentInfo, HostEvent, HostNotifier, InstanceHandle, LoadedPackage,
    PackageLoader, PackageState, PackageSummary, PermissionPolicy, PluginError, PluginResult,
    Sandbox, SandboxConfig, SettingsStore,
};

/// Everything needed to assemble a coordinator.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Root holding one subdirectory per package.
    pub packages_dir: PathBuf,
    /// Enabled-set and per-package settings file.
    pub settings_file: PathBuf,
    pub sandbox: SandboxConfig,
    pub permission_policy: PermissionPolicy,
}

/// Orchestrates loader, sandbox, capability registries and persistence.
pub struct LifecycleCoordinator {
    loader: PackageLoader,
    sandbox: Sandbox,
    capabilities: CapabilityFactory,
    settings: Arc<SettingsStore>,
    notifier: Arc<dyn HostNotifier>,
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("loader", &self.loader)
            .field("sandbox", &self.sandbox)
            .field("settings", &self.settings.path())
            .finish()
    }
}

impl LifecycleCoordinator {
    /// Wire up the runtime from already-built parts.
    pub fn new(
        loader: PackageLoader,
        sandbox: Sandbox,
        settings: Arc<SettingsStore>,
        policy: PermissionPolicy,
        notifier: Arc<dyn HostNotifier>,
    ) -> Self {
        let capabilities =
            CapabilityFactory::new(Arc::clone(&settings), Arc::clone(&notifier), policy);
        Self { loader, sandbox, capabilities, settings, notifier }
    }

    /// Build every component from options and start the engine thread.
    pub fn open(options: RuntimeOptions, notifier: Arc<dyn HostNotifier>) -> PluginResult<Self> {
        let loader = PackageLoader::new(options.packages_dir)?;
        let settings = Arc::new(SettingsStore::load(options.settings_file)?);
        let sandbox = Sandbox::spawn(options.sandbox)?;
        Ok(Self::new(loader, sandbox, settings, options.permission_policy, notifier))
    }

    /// Discover packages, activate the persisted enabled-set in discovery
    /// order, then publish the catalog.
    pub async fn initialize_packages(&mut self) {
        self.reap_faults();
        if !self.sandbox.is_empty() {
            self.stop_running().await;
        }

        self.loader.discover();

        let enabled = self.settings.enabled_plugin_ids();
        for id in &enabled {
            if self.loader.get(id).is_none() {
                tracing::warn!(package = %id, "Enabled package is not installed");
            }
        }

        let to_activate: Vec<String> = self
            .loader
            .list()
            .iter()
            .map(|p| p.id().to_string())
            .filter(|id| enabled.contains(id))
            .collect();

        for id in to_activate {
            self.activate(&id).await;
        }

        tracing::info!(
            packages = self.loader.len(),
            running = self.sandbox.len(),
            "Packages initialized"
        );
        self.notify_catalog();
    }

    /// Activate a package. Already-enabled packages succeed without work;
    /// packages in `error` are refused.
    pub async fn activate(&mut self, id: &str) -> bool {
        self.reap_faults();
        let Some(package) = self.loader.get(id) else {
            tracing::warn!(package = %id, "Cannot activate unknown package");
            self.notify_error(id, format!("Package not found: {id}"));
            return false;
        };

        match package.state {
            PackageState::Enabled => {
                tracing::debug!(package = %id, "Package already enabled");
                return true;
            }
            PackageState::Error => {
                let err = PluginError::Errored {
                    package: id.to_string(),
                    reason: package.error.clone().unwrap_or_default(),
                };
                tracing::warn!(package = %id, error = %err, "Refusing to activate");
                self.notify_error(id, err.to_string());
                return false;
            }
            PackageState::Installed | PackageState::Disabled => {}
        }

        let package = package.clone();
        match self.start(&package).await {
            Ok(handle) => {
                self.loader.set_state(id, PackageState::Enabled);
                self.loader.set_instance(id, Some(handle));
                if !self.settings.is_enabled(id) {
                    if let Err(e) = self.settings.enable(id) {
                        tracing::error!(
                            package = %id,
                            error = %e,
                            "Failed to persist enabled state"
                        );
                        self.notify_error(id, format!("Failed to save settings: {e}"));
                    }
                }

                tracing::info!(package = %id, handle = %handle, "Package activated");
                self.notifier.notify(HostEvent::StateChanged {
                    id: id.to_string(),
                    state: PackageState::Enabled,
                });
                true
            }
            Err(e) => {
                self.fail(id, e.to_string());
                false
            }
        }
    }

    async fn start(&mut self, package: &LoadedPackage) -> PluginResult<InstanceHandle> {
        let api = self.capabilities.create_api(package);
        let instance = self.sandbox.execute(package, api).await?;
        self.sandbox.activate(package.id()).await?;
        Ok(instance.handle)
    }

    /// Roll back a failed activation and report it.
    fn fail(&mut self, id: &str, message: String) {
        self.sandbox.discard(id);
        self.capabilities.clear_package_api(id);
        self.loader.mark_error(id, message.clone());

        tracing::error!(package = %id, error = %message, "Package activation failed");
        self.notifier
            .notify(HostEvent::StateChanged { id: id.to_string(), state: PackageState::Error });
        self.notify_error(id, message);
    }

    /// Deactivate an enabled package. Anything else succeeds without work.
    pub async fn deactivate(&mut self, id: &str) -> bool {
        self.reap_faults();
        let Some(package) = self.loader.get(id) else {
            tracing::warn!(package = %id, "Cannot deactivate unknown package");
            return false;
        };

        if package.state != PackageState::Enabled {
            tracing::debug!(
                package = %id,
                state = %package.state,
                "Package not enabled, nothing to deactivate"
            );
            return true;
        }

        self.teardown(id).await;
        self.loader.set_state(id, PackageState::Disabled);
        if let Err(e) = self.settings.disable(id) {
            tracing::error!(package = %id, error = %e, "Failed to persist disabled state");
            self.notify_error(id, format!("Failed to save settings: {e}"));
        }

        tracing::info!(package = %id, "Package deactivated");
        self.notifier
            .notify(HostEvent::StateChanged { id: id.to_string(), state: PackageState::Disabled });
        true
    }

    /// Stop the instance and drop its registrations. Settings stay.
    async fn teardown(&mut self, id: &str) {
        self.sandbox.stop(id).await;
        self.capabilities.clear_package_api(id);
        self.loader.set_instance(id, None);
    }

    /// Copy a package into the packages root. It starts `installed`.
    ///
    /// Reinstalling a running package stops it first; it stays in the
    /// enabled-set and comes back on the next initialization.
    pub async fn install(&mut self, source: &Path) -> Option<LoadedPackage> {
        self.reap_faults();
        let id = PackageLoader::inspect_source(source).ok().map(|(_, id)| id);
        if let Some(id) = id.as_deref() {
            if self.sandbox.is_running(id) {
                tracing::info!(package = %id, "Stopping running package before reinstall");
                self.teardown(id).await;
            }
        }

        let package = self.loader.install(source);
        if package.is_none() {
            let subject = id.unwrap_or_else(|| source.display().to_string());
            let message = format!("Failed to install package from {}", source.display());
            self.notify_error(&subject, message);
        }

        self.notify_catalog();
        package
    }

    /// Deactivate (if needed) and delete a package.
    pub async fn uninstall(&mut self, id: &str) -> bool {
        if self.loader.get(id).is_none() {
            tracing::warn!(package = %id, "Cannot uninstall unknown package");
            return false;
        }

        self.deactivate(id).await;
        if self.sandbox.is_running(id) {
            self.teardown(id).await;
        }

        if !self.loader.uninstall(id) {
            self.notify_error(id, format!("Failed to remove package '{id}'"));
            return false;
        }

        if self.settings.is_enabled(id) {
            if let Err(e) = self.settings.disable(id) {
                tracing::error!(package = %id, error = %e, "Failed to persist disabled state");
            }
        }

        self.notify_catalog();
        true
    }

    /// Stop everything and initialize from scratch.
    pub async fn reload(&mut self) {
        tracing::info!("Reloading packages");
        self.stop_running().await;
        self.capabilities.registry().clear_all();
        self.initialize_packages().await;
    }

    /// Stop every running instance. Persisted state is left alone.
    pub async fn shutdown(&mut self) {
        self.reap_faults();
        self.stop_running().await;
        tracing::info!("Package runtime shut down");
    }

    /// Move packages the sandbox withdrew on its own into `error`.
    ///
    /// The host was already notified when the sandbox withdrew them. Returns
    /// the identifiers that changed.
    pub fn reap_faults(&mut self) -> Vec<String> {
        let faults = self.sandbox.take_faults();
        let mut reaped = Vec::with_capacity(faults.len());
        for fault in faults {
            self.capabilities.clear_package_api(&fault.package_id);
            self.loader.mark_error(&fault.package_id, fault.reason);
            tracing::warn!(
                package = %fault.package_id,
                handle = %fault.handle,
                "Package moved to error"
            );
            reaped.push(fault.package_id);
        }
        reaped
    }

    async fn stop_running(&mut self) {
        for id in self.sandbox.running_ids() {
            self.teardown(&id).await;
            if self.loader.get(&id).is_some_and(|p| p.state == PackageState::Enabled) {
                self.loader.set_state(&id, PackageState::Disabled);
            }
        }
    }

    /// Catalog rows in discovery order.
    pub fn list_packages(&self) -> Vec<PackageSummary> {
        self.loader.list().iter().map(PackageSummary::from).collect()
    }

    pub fn get(&self, id: &str) -> Option<&LoadedPackage> {
        self.loader.get(id)
    }

    pub fn packages_dir(&self) -> &Path {
        self.loader.packages_dir()
    }

    /// Ensure the packages root exists and return it for the host to open.
    pub fn open_packages_directory(&self) -> Option<PathBuf> {
        let dir = self.loader.packages_dir();
        match std::fs::create_dir_all(dir) {
            Ok(()) => Some(dir.to_path_buf()),
            Err(e) => {
                tracing::error!(
                    dir = %dir.display(),
                    error = %e,
                    "Cannot create packages directory"
                );
                None
            }
        }
    }

    pub fn enabled_package_ids(&self) -> Vec<String> {
        self.settings.enabled_plugin_ids()
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn capabilities(&self) -> &CapabilityFactory {
        &self.capabilities
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Run a command by its fully-qualified id.
    pub async fn execute_command(&self, command_id: &str) -> bool {
        self.capabilities.execute_command(command_id).await
    }

    /// Publish the current document to every subscribed package.
    pub async fn set_current_document(&self, document: Option<DocumentInfo>) {
        self.capabilities.set_current_document(document).await;
    }

    fn notify_catalog(&self) {
        self.notifier.notify(HostEvent::CatalogChanged { packages: self.list_packages() });
    }

    fn notify_error(&self, id: &str, message: String) {
        self.notifier.notify(HostEvent::Error { id: id.to_string(), message });
    }
}
