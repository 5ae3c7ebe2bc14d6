//! The engine thread: owns the QuickJS runtime and one context per package.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rquickjs::{Context, Ctx, Function, Object, Persistent, Runtime};
use serde::Deserialize;

use super::bindings::{self, Bridge};
use super::{
    CallError, EngineRequest, GuestCall, InstanceHandle, LoadOutcome, SandboxConfig, SandboxFault,
};
use crate::plugin::CapabilityApi;

const PRELUDE: &str = include_str!("prelude.js");

/// Maximum JS stack, kept well under the engine thread's native stack.
const MAX_STACK_SIZE: usize = 1024 * 1024;

/// Sleep between polls while a guest promise is pending.
const WAIT_POLL: Duration = Duration::from_millis(2);

type Deadline = Arc<Mutex<Option<Instant>>>;

pub(super) type Faults = Arc<Mutex<Vec<SandboxFault>>>;

/// A package context and the control object its prelude handed back.
///
/// The control object is held only by the engine; guest code cannot reach it.
#[derive(Clone)]
struct Guest {
    context: Context,
    control: Persistent<Object<'static>>,
}

struct PackageContext {
    guest: Guest,
    handle: InstanceHandle,
    api: CapabilityApi,
    /// Live guest timers after the last call.
    timers: u32,
    /// Set once the package is discarded; host functions refuse to act after that.
    revoked: Arc<AtomicBool>,
}

impl Drop for PackageContext {
    fn drop(&mut self) {
        self.revoked.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize)]
struct CallState {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportsState {
    has_activate: bool,
    has_deactivate: bool,
}

struct Engine {
    // Contexts go before the runtime that owns them.
    contexts: HashMap<String, PackageContext>,
    runtime: Runtime,
    deadline: Deadline,
    config: SandboxConfig,
    requests: Sender<EngineRequest>,
    faults: Faults,
}

/// Entry point of the engine thread.
pub(super) fn run(
    config: SandboxConfig,
    rx: Receiver<EngineRequest>,
    requests: Sender<EngineRequest>,
    faults: Faults,
    ready: SyncSender<Result<(), String>>,
) {
    let mut engine = match Engine::new(config, requests, faults) {
        Ok(engine) => {
            let _ = ready.send(Ok(()));
            engine
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to start sandbox engine");
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    loop {
        match rx.recv_timeout(engine.config.tick) {
            Ok(EngineRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(request) => engine.handle(request),
            Err(RecvTimeoutError::Timeout) => {}
        }
        engine.pump_timers();
    }

    engine.contexts.clear();
    tracing::debug!("Sandbox engine stopped");
}

/// Text of a pending engine exception, clearing it from the context.
fn exception_message(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !matches!(error, rquickjs::Error::Exception) {
        return error.to_string();
    }

    let value = ctx.catch();
    if let Some(exception) = value.as_exception() {
        return exception.message().unwrap_or_else(|| "Unknown exception".to_string());
    }
    value
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "Non-error value thrown".to_string())
}

fn control_fn<'js>(
    ctx: &Ctx<'js>,
    control: &Persistent<Object<'static>>,
    name: &str,
) -> rquickjs::Result<Function<'js>> {
    control.clone().restore(ctx)?.get(name)
}

fn timer_count(guest: &Guest) -> u32 {
    guest.context.with(|ctx| {
        control_fn(&ctx, &guest.control, "timerCount")
            .and_then(|f| f.call::<_, u32>(()))
            .unwrap_or_else(|e| {
                let _ = exception_message(&ctx, e);
                0
            })
    })
}

impl Engine {
    fn new(
        config: SandboxConfig,
        requests: Sender<EngineRequest>,
        faults: Faults,
    ) -> rquickjs::Result<Self> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(MAX_STACK_SIZE);

        let deadline: Deadline = Arc::new(Mutex::new(None));
        let watched = Arc::clone(&deadline);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            watched.lock().is_some_and(|at| Instant::now() >= at)
        })));

        Ok(Self { contexts: HashMap::new(), runtime, deadline, config, requests, faults })
    }

    fn arm(&self, budget: Duration) {
        *self.deadline.lock() = Some(Instant::now() + budget);
    }

    fn disarm(&self) {
        *self.deadline.lock() = None;
    }

    fn expired(&self) -> bool {
        self.deadline.lock().is_some_and(|at| Instant::now() >= at)
    }

    /// Turn a failure into a timeout when the deadline is what stopped it.
    fn classify(&self, error: CallError) -> CallError {
        match error {
            CallError::Failed(_) if self.expired() => CallError::TimedOut,
            other => other,
        }
    }

    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Load { package_id, handle, root, entry, source, api, reply } => {
                let result = self.load(&package_id, handle, &root, &entry, source, api);
                if let Err(e) = &result {
                    tracing::debug!(package = %package_id, error = ?e, "Entry point failed");
                }
                let _ = reply.send(result);
            }
            EngineRequest::Call { package_id, call, timeout, reply } => {
                let result = self.call(&package_id, &call, timeout);
                let _ = reply.send(result);
            }
            EngineRequest::Discard { package_id } => {
                if self.contexts.remove(&package_id).is_some() {
                    self.runtime.run_gc();
                    tracing::debug!(package = %package_id, "Sandbox context discarded");
                }
            }
            EngineRequest::Shutdown => {}
        }
    }

    /// Run queued promise jobs until the queue is empty or the deadline passes.
    fn drain_jobs(&self) {
        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => tracing::debug!("Guest promise job threw"),
            }
            if self.expired() {
                break;
            }
        }
    }

    fn guest_config(&self) -> String {
        serde_json::json!({
            "maxTimers": self.config.max_timers,
            "maxTimerDelay": super::millis(self.config.max_timer_delay),
            "minTimerInterval": super::millis(self.config.min_timer_interval),
        })
        .to_string()
    }

    fn load(
        &mut self,
        package_id: &str,
        handle: InstanceHandle,
        root: &Path,
        entry: &Path,
        source: String,
        api: CapabilityApi,
    ) -> Result<LoadOutcome, CallError> {
        self.contexts.remove(package_id);

        let context = Context::full(&self.runtime).map_err(|e| CallError::Failed(e.to_string()))?;
        let revoked = Arc::new(AtomicBool::new(false));
        let bridge = Bridge {
            package_id: package_id.to_string(),
            root: root.to_path_buf(),
            api: api.clone(),
            requests: self.requests.clone(),
            callback_timeout: self.config.callback_timeout,
            revoked: Arc::clone(&revoked),
        };
        let guest_config = self.guest_config();
        let filename = entry.to_string_lossy().into_owned();
        let dirname = entry.parent().unwrap_or(root).to_string_lossy().into_owned();

        self.arm(self.config.execution_timeout);
        let evaluated = context.with(|ctx| {
            let run = || -> rquickjs::Result<(String, Persistent<Object<'static>>)> {
                ctx.eval::<(), _>(PRELUDE)?;
                let host = bindings::host_object(&ctx, bridge)?;
                let bootstrap: Function = ctx.globals().get("__folioBootstrap")?;
                let control: Object = bootstrap.call((host, guest_config))?;
                let load: Function = control.get("loadEntry")?;
                let summary: String = load.call((source, filename, dirname))?;
                Ok((summary, Persistent::save(&ctx, control)))
            };
            run().map_err(|e| exception_message(&ctx, e))
        });
        self.drain_jobs();
        let result = evaluated.map_err(|message| self.classify(CallError::Failed(message)));
        self.disarm();

        let (summary, control) = result?;
        let exports: ExportsState = serde_json::from_str(&summary)
            .map_err(|e| CallError::Failed(format!("unreadable exports summary: {e}")))?;

        let guest = Guest { context, control };
        let timers = timer_count(&guest);
        let entry = PackageContext { guest, handle, api, timers, revoked };
        self.contexts.insert(package_id.to_string(), entry);

        Ok(LoadOutcome {
            has_activate: exports.has_activate,
            has_deactivate: exports.has_deactivate,
        })
    }

    fn read_status(guest: &Guest) -> Result<Option<()>, CallError> {
        let raw = guest.context.with(|ctx| {
            control_fn(&ctx, &guest.control, "status")
                .and_then(|f| f.call::<_, String>(()))
                .map_err(|e| exception_message(&ctx, e))
        });
        let state: CallState = serde_json::from_str(&raw.map_err(CallError::Failed)?)
            .map_err(|e| CallError::Failed(e.to_string()))?;

        match state.status.as_str() {
            "ok" => Ok(Some(())),
            "pending" => Ok(None),
            "missing" => Err(CallError::Missing),
            _ => {
                let message = state.error.unwrap_or_else(|| "Unknown error".to_string());
                Err(CallError::Failed(message))
            }
        }
    }

    /// Fire due timers of one context. The caller arms the deadline.
    fn fire_timers(package_id: &str, guest: &Guest) -> u32 {
        guest.context.with(|ctx| {
            control_fn(&ctx, &guest.control, "runTimers")
                .and_then(|f| f.call::<_, u32>(()))
                .unwrap_or_else(|e| {
                    let message = exception_message(&ctx, e);
                    tracing::warn!(package = %package_id, error = %message, "Timer pass failed");
                    0
                })
        })
    }

    fn call(
        &mut self,
        package_id: &str,
        call: &GuestCall,
        timeout: Duration,
    ) -> Result<(), CallError> {
        let guest = match self.contexts.get(package_id) {
            Some(entry) => entry.guest.clone(),
            None => return Err(CallError::NoContext),
        };
        let (kind, name, payload) = call.parts();

        self.arm(timeout);
        let started = guest.context.with(|ctx| {
            control_fn(&ctx, &guest.control, "begin")
                .and_then(|f| f.call::<_, ()>((kind, name, payload)))
                .map_err(|e| exception_message(&ctx, e))
        });

        let outcome = match started {
            Err(message) => Err(self.classify(CallError::Failed(message))),
            Ok(()) => loop {
                self.drain_jobs();
                match Self::read_status(&guest) {
                    Ok(Some(())) => break Ok(()),
                    Ok(None) => {}
                    Err(e) => break Err(self.classify(e)),
                }
                if self.expired() {
                    break Err(CallError::TimedOut);
                }
                Self::fire_timers(package_id, &guest);
                std::thread::sleep(WAIT_POLL);
            },
        };
        self.disarm();

        let timers = timer_count(&guest);
        if let Some(entry) = self.contexts.get_mut(package_id) {
            entry.timers = timers;
        }

        match &outcome {
            Err(CallError::TimedOut) => {
                tracing::warn!(package = %package_id, kind, ?timeout, "Guest call timed out");
            }
            Err(CallError::Failed(message)) => {
                tracing::debug!(package = %package_id, kind, error = %message, "Guest call failed");
            }
            _ => {}
        }
        outcome
    }

    /// Fire due timers in every context that has any.
    ///
    /// A package whose timer pass overruns `callback_timeout` is withdrawn
    /// and the pass ends there, so queued requests are served before the
    /// next package's timers run.
    fn pump_timers(&mut self) {
        let due: Vec<(String, Guest)> = self
            .contexts
            .iter()
            .filter(|(_, entry)| entry.timers > 0)
            .map(|(id, entry)| (id.clone(), entry.guest.clone()))
            .collect();

        for (package_id, guest) in due {
            self.arm(self.config.callback_timeout);
            let remaining = Self::fire_timers(&package_id, &guest);
            self.drain_jobs();
            let overran = self.expired();
            self.disarm();

            if overran {
                let reason = format!(
                    "Timer callback exceeded {} ms; package stopped",
                    super::millis(self.config.callback_timeout)
                );
                self.withdraw(&package_id, reason);
                break;
            } else if let Some(entry) = self.contexts.get_mut(&package_id) {
                entry.timers = remaining;
            }
        }
    }

    /// Drop a package's context on the engine's own initiative and report it.
    fn withdraw(&mut self, package_id: &str, reason: String) {
        let Some(entry) = self.contexts.remove(package_id) else {
            return;
        };
        let handle = entry.handle;
        let api = entry.api.clone();
        drop(entry);
        self.runtime.run_gc();

        tracing::error!(
            package = %package_id,
            handle = %handle,
            error = %reason,
            "Package withdrawn"
        );
        api.revoke(&reason);
        let fault = SandboxFault { package_id: package_id.to_string(), handle, reason };
        self.faults.lock().push(fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_defines_bootstrap() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            ctx.eval::<(), _>(PRELUDE).unwrap();
            let bootstrap: rquickjs::Value = ctx.globals().get("__folioBootstrap").unwrap();
            assert!(bootstrap.is_function());
        });
    }

    #[test]
    fn test_exception_message_reads_error_text() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let err = ctx.eval::<(), _>("throw new Error('boom')").unwrap_err();
            assert_eq!(exception_message(&ctx, err), "boom");

            let err = ctx.eval::<(), _>("throw 'plain'").unwrap_err();
            assert_eq!(exception_message(&ctx, err), "plain");
        });
    }
}
