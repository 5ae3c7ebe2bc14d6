//! Execution Sandbox.
//!
//! Package code is JavaScript run by an embedded QuickJS engine. A single
//! engine runtime lives on a dedicated thread; every package gets its own
//! context, so globals are never shared between packages. The rest of the
//! runtime talks to that thread only through [`EngineRequest`] messages with
//! one-shot replies, and every round trip is bounded by a timeout on both
//! ends: the engine interrupts guest code past its deadline, and the caller
//! stops waiting shortly after.

mod bindings;
mod engine;
pub mod require;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{CapabilityApi, DocumentInfo, LoadedPackage, PluginError, PluginResult};

pub use require::{RequireError, ResolvedModule, HOST_MODULES};

/// Extra time the caller waits beyond the engine-side deadline.
const REPLY_GRACE: Duration = Duration::from_millis(500);

/// Native stack of the engine thread.
const ENGINE_THREAD_STACK: usize = 4 * 1024 * 1024;

/// Opaque handle of a running sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(Uuid);

impl InstanceHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Limits applied to guest code.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Budget for evaluating an entry point's top level.
    pub execution_timeout: Duration,
    /// Budget for the `activate` hook, including any promise it returns.
    pub activation_timeout: Duration,
    /// Budget for the `deactivate` hook.
    pub deactivation_timeout: Duration,
    /// Budget for one command handler, document listener or timer pass.
    pub callback_timeout: Duration,
    pub max_timer_delay: Duration,
    pub min_timer_interval: Duration,
    /// Live timers allowed per package.
    pub max_timers: u32,
    /// Engine heap limit in bytes.
    pub memory_limit: usize,
    /// How often pending timers are pumped.
    pub tick: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(5),
            activation_timeout: Duration::from_secs(10),
            deactivation_timeout: Duration::from_secs(5),
            callback_timeout: Duration::from_secs(5),
            max_timer_delay: Duration::from_secs(60),
            min_timer_interval: Duration::from_millis(100),
            max_timers: 64,
            memory_limit: 64 * 1024 * 1024,
            tick: Duration::from_millis(20),
        }
    }
}

/// A package whose entry point has been evaluated.
#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub package_id: String,
    pub handle: InstanceHandle,
    /// Exports carry an `activate` function.
    pub has_activate: bool,
    /// Exports carry a `deactivate` function.
    pub has_deactivate: bool,
    pub started_at: Instant,
}

/// A package the engine withdrew on its own, outside any host call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFault {
    pub package_id: String,
    /// Instance that was withdrawn.
    pub handle: InstanceHandle,
    pub reason: String,
}

/// A guest function the engine can invoke.
#[derive(Debug, Clone)]
pub(crate) enum GuestCall {
    Activate,
    Deactivate,
    Command(String),
    Document { listener: String, document: Option<DocumentInfo> },
}

impl GuestCall {
    /// `(kind, name, payload)` as passed to the guest dispatcher.
    fn parts(&self) -> (&'static str, Option<String>, Option<String>) {
        match self {
            Self::Activate => ("activate", None, None),
            Self::Deactivate => ("deactivate", None, None),
            Self::Command(local_id) => ("command", Some(local_id.clone()), None),
            Self::Document { listener, document } => (
                "document",
                Some(listener.clone()),
                document.as_ref().and_then(|doc| serde_json::to_string(doc).ok()),
            ),
        }
    }
}

/// How a guest call ended, seen from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallError {
    /// The guest function does not exist.
    Missing,
    /// Guest code threw or its promise rejected.
    Failed(String),
    /// The deadline passed first.
    TimedOut,
    /// No context exists for the package.
    NoContext,
}

/// Exports summary returned after evaluating an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoadOutcome {
    pub has_activate: bool,
    pub has_deactivate: bool,
}

/// Message to the engine thread.
pub(crate) enum EngineRequest {
    Load {
        package_id: String,
        handle: InstanceHandle,
        root: PathBuf,
        entry: PathBuf,
        source: String,
        api: CapabilityApi,
        reply: oneshot::Sender<Result<LoadOutcome, CallError>>,
    },
    Call {
        package_id: String,
        call: GuestCall,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Discard {
        package_id: String,
    },
    Shutdown,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Post a request and wait for its reply, at most `wait` plus a grace period.
async fn round_trip<T>(
    requests: &mpsc::Sender<EngineRequest>,
    package_id: &str,
    wait: Duration,
    build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
) -> PluginResult<T> {
    let (tx, rx) = oneshot::channel();
    requests
        .send(build(tx))
        .map_err(|_| PluginError::SandboxUnavailable("engine thread has stopped".to_string()))?;

    match tokio::time::timeout(wait + REPLY_GRACE, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => {
            Err(PluginError::SandboxUnavailable("engine dropped the request".to_string()))
        }
        Err(_) => Err(PluginError::Timeout(package_id.to_string(), millis(wait))),
    }
}

fn call_error(package_id: &str, error: CallError, timeout: Duration) -> PluginError {
    match error {
        CallError::Missing => {
            PluginError::ExecutionError(format!("{package_id}: guest function not found"))
        }
        CallError::Failed(message) => {
            PluginError::ExecutionError(format!("{package_id}: {message}"))
        }
        CallError::TimedOut => PluginError::Timeout(package_id.to_string(), millis(timeout)),
        CallError::NoContext => PluginError::NotFound(package_id.to_string()),
    }
}

/// Invoke a guest function and wait for it, including any promise it returns.
async fn call_guest(
    requests: &mpsc::Sender<EngineRequest>,
    package_id: &str,
    call: GuestCall,
    timeout: Duration,
) -> PluginResult<()> {
    let reply = round_trip(requests, package_id, timeout, |reply| EngineRequest::Call {
        package_id: package_id.to_string(),
        call,
        timeout,
        reply,
    })
    .await?;
    reply.map_err(|e| call_error(package_id, e, timeout))
}

/// Host-side handle of the engine thread and the set of running instances.
///
/// At most one instance exists per package identifier.
pub struct Sandbox {
    requests: mpsc::Sender<EngineRequest>,
    config: SandboxConfig,
    running: HashMap<String, RunningInstance>,
    faults: engine::Faults,
    thread: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("running", &self.running.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Sandbox {
    /// Start the engine thread.
    pub fn spawn(config: SandboxConfig) -> PluginResult<Self> {
        let (requests, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let engine_config = config.clone();
        let engine_requests = requests.clone();
        let faults: engine::Faults = Arc::new(Mutex::new(Vec::new()));
        let engine_faults = Arc::clone(&faults);

        let thread = thread::Builder::new()
            .name("folio-sandbox".to_string())
            .stack_size(ENGINE_THREAD_STACK)
            .spawn(move || {
                engine::run(engine_config, rx, engine_requests, engine_faults, ready_tx);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(PluginError::SandboxUnavailable(message)),
            Err(_) => {
                return Err(PluginError::SandboxUnavailable(
                    "engine thread exited during startup".to_string(),
                ))
            }
        }

        tracing::debug!(?config, "Sandbox engine started");
        Ok(Self { requests, config, running: HashMap::new(), faults, thread: Some(thread) })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Evaluate a package's entry point in a fresh context.
    ///
    /// The exports become the running instance. Errors propagate; package
    /// state is left to the caller.
    pub async fn execute(
        &mut self,
        package: &LoadedPackage,
        api: CapabilityApi,
    ) -> PluginResult<RunningInstance> {
        let package_id = package.id().to_string();
        if self.running.contains_key(&package_id) {
            return Err(PluginError::AlreadyRunning(package_id));
        }

        let entry = package.entry_path();
        let source = tokio::fs::read_to_string(&entry).await.map_err(|e| {
            PluginError::LoadError(format!("{}: {e}", entry.display()))
        })?;

        let handle = InstanceHandle::new();
        let timeout = self.config.execution_timeout;
        let outcome = round_trip(&self.requests, &package_id, timeout, |reply| {
            EngineRequest::Load {
                package_id: package_id.clone(),
                handle,
                root: package.path.clone(),
                entry: entry.clone(),
                source,
                api,
                reply,
            }
        })
        .await?
        .map_err(|e| call_error(&package_id, e, timeout))?;

        let instance = RunningInstance {
            package_id: package_id.clone(),
            handle,
            has_activate: outcome.has_activate,
            has_deactivate: outcome.has_deactivate,
            started_at: Instant::now(),
        };
        tracing::debug!(
            package = %package_id,
            handle = %instance.handle,
            has_activate = instance.has_activate,
            has_deactivate = instance.has_deactivate,
            "Entry point evaluated"
        );

        self.running.insert(package_id, instance.clone());
        Ok(instance)
    }

    /// Run the instance's `activate` hook, if it has one.
    pub async fn activate(&self, package_id: &str) -> PluginResult<()> {
        let instance = self
            .running
            .get(package_id)
            .ok_or_else(|| PluginError::NotFound(package_id.to_string()))?;
        if !instance.has_activate {
            return Ok(());
        }

        call_guest(&self.requests, package_id, GuestCall::Activate, self.config.activation_timeout)
            .await
    }

    /// Run the `deactivate` hook under its timeout, then discard the instance.
    ///
    /// Hook failures and timeouts are logged; the instance is removed
    /// regardless. Returns whether an instance existed.
    pub async fn stop(&mut self, package_id: &str) -> bool {
        let Some(instance) = self.running.remove(package_id) else {
            tracing::debug!(package = %package_id, "No running instance to stop");
            return false;
        };

        if instance.has_deactivate {
            let timeout = self.config.deactivation_timeout;
            match call_guest(&self.requests, package_id, GuestCall::Deactivate, timeout).await {
                Ok(()) => tracing::debug!(package = %package_id, "Deactivation hook completed"),
                Err(e) if e.is_timeout() => {
                    tracing::warn!(
                        package = %package_id,
                        error = %e,
                        "Deactivation hook timed out, forcing cleanup"
                    );
                }
                Err(e) => {
                    tracing::warn!(package = %package_id, error = %e, "Deactivation hook failed");
                }
            }
        }

        self.send_discard(package_id);
        tracing::debug!(
            package = %package_id,
            handle = %instance.handle,
            uptime = ?instance.started_at.elapsed(),
            "Instance stopped"
        );
        true
    }

    /// Stop every running instance.
    pub async fn stop_all(&mut self) {
        for package_id in self.running_ids() {
            self.stop(&package_id).await;
        }
    }

    /// Drop an instance without running its `deactivate` hook.
    pub fn discard(&mut self, package_id: &str) -> bool {
        let existed = self.running.remove(package_id).is_some();
        self.send_discard(package_id);
        existed
    }

    fn send_discard(&self, package_id: &str) {
        let request = EngineRequest::Discard { package_id: package_id.to_string() };
        if self.requests.send(request).is_err() {
            tracing::debug!(package = %package_id, "Engine gone; nothing to discard");
        }
    }

    /// Instances the engine withdrew since the last call.
    ///
    /// Each one is dropped from the running set. Faults of instances that
    /// were already stopped or replaced are ignored.
    pub fn take_faults(&mut self) -> Vec<SandboxFault> {
        let faults = std::mem::take(&mut *self.faults.lock());
        faults
            .into_iter()
            .filter(|fault| {
                let current = self
                    .running
                    .get(&fault.package_id)
                    .is_some_and(|instance| instance.handle == fault.handle);
                if current {
                    self.running.remove(&fault.package_id);
                }
                current
            })
            .collect()
    }

    pub fn is_running(&self, package_id: &str) -> bool {
        self.running.contains_key(package_id)
    }

    /// Identifiers with a running instance, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = self.requests.send(EngineRequest::Shutdown);
        // Detached: a guest stuck past its deadline must not hang the host.
        drop(self.thread.take());
    }
}
