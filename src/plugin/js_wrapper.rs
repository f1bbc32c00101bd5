//! Thread-safe handle to a plugin's JavaScript runtime
//!
//! Deno runtimes are single-threaded, so each plugin gets a dedicated worker
//! thread running a current-thread Tokio runtime. Calls are queued over a
//! channel and executed one at a time; the caller races the reply against
//! its context and a hard backstop, and interrupts the script when it gives
//! up waiting.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use deno_core::v8;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::js_runtime::{JsRuntimeWrapper, RuntimeLimits};
use super::manifest::PluginManifest;
use crate::core::error::{MangoError, PluginError};

/// Stack of a plugin worker thread; V8 and the HTML query parsers run on it
const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Calling this function makes the worker panic mid-call
#[cfg(test)]
pub(crate) const PANIC_TRIGGER: &str = "__worker_panic__";

/// Cancellation and deadline of a call, supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that never expires on its own
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a context cancelled together with `token`
    pub fn with_cancel(token: &CancellationToken) -> Self {
        Self {
            cancel: token.child_token(),
            deadline: None,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

/// Lets callers stop the script of a call they stopped waiting for
struct Interrupt {
    isolate: v8::IsolateHandle,
    active: Mutex<Option<(u64, CancellationToken)>>,
}

impl Interrupt {
    fn new(isolate: v8::IsolateHandle) -> Self {
        Self {
            isolate,
            active: Mutex::new(None),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(u64, CancellationToken)>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin(&self, call_id: u64, cancel: CancellationToken) {
        *self.slot() = Some((call_id, cancel));
    }

    fn finish(&self) {
        let mut active = self.slot();
        *active = None;
        self.isolate.cancel_terminate_execution();
    }

    /// Interrupt `call_id` if it is the call currently running
    fn abandon(&self, call_id: u64) -> bool {
        let active = self.slot();
        match active.as_ref() {
            Some((id, cancel)) if *id == call_id => {
                cancel.cancel();
                self.isolate.terminate_execution();
                true
            }
            _ => false,
        }
    }

    fn abandon_current(&self) {
        if let Some((_, cancel)) = self.slot().as_ref() {
            cancel.cancel();
            self.isolate.terminate_execution();
        }
    }
}

enum JsCommand {
    Call {
        call_id: u64,
        function: String,
        args: Vec<Value>,
        cancel: CancellationToken,
        resp: oneshot::Sender<Result<Value, PluginError>>,
    },
}

/// Send + Sync handle to one plugin runtime
///
/// Dropping the handle stops the worker once its current call returns.
pub struct JsPluginRuntime {
    plugin_id: String,
    plugin_dir: PathBuf,
    call_timeout: Duration,
    tx: mpsc::Sender<JsCommand>,
    interrupt: Arc<Interrupt>,
    next_call: AtomicU64,
}

impl JsPluginRuntime {
    /// Start the worker thread and construct the runtime on it
    ///
    /// Resolves once the entry script has been evaluated and validated.
    pub async fn start(plugin_dir: &Path, manifest: &PluginManifest, limits: RuntimeLimits) -> Result<Self, MangoError> {
        let plugin_id = manifest.id.clone();
        let call_timeout = limits.call_timeout;

        let (tx, mut rx) = mpsc::channel::<JsCommand>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Arc<Interrupt>, MangoError>>();

        let worker_id = plugin_id.clone();
        let worker_dir = plugin_dir.to_path_buf();
        let worker_manifest = manifest.clone();

        thread::Builder::new()
            .name(format!("js-plugin-{}", plugin_id))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                debug!(plugin_id = %worker_id, "Starting JS worker thread");

                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(MangoError::PluginLoadError(format!(
                            "{}: failed to create worker runtime: {}",
                            worker_id, e
                        ))));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let mut runtime = match JsRuntimeWrapper::new(&worker_dir, &worker_manifest, limits) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!(plugin_id = %worker_id, error = %e, "Failed to create JS runtime");
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    let interrupt = Arc::new(Interrupt::new(runtime.isolate_handle()));
                    if ready_tx.send(Ok(interrupt.clone())).is_err() {
                        return;
                    }
                    info!(plugin_id = %worker_id, "JS runtime ready");

                    while let Some(cmd) = rx.recv().await {
                        match cmd {
                            JsCommand::Call {
                                call_id,
                                function,
                                args,
                                cancel,
                                resp,
                            } => {
                                if resp.is_closed() || cancel.is_cancelled() {
                                    debug!(plugin_id = %worker_id, function = %function, "Skipping abandoned call");
                                    continue;
                                }

                                interrupt.begin(call_id, cancel.clone());
                                let call = async {
                                    #[cfg(test)]
                                    if function == PANIC_TRIGGER {
                                        panic!("worker panic requested");
                                    }
                                    runtime.call_function(&function, &args, cancel).await
                                };
                                let outcome = AssertUnwindSafe(call).catch_unwind().await;
                                interrupt.finish();

                                match outcome {
                                    Ok(result) => {
                                        let _ = resp.send(result);
                                    }
                                    Err(panic) => {
                                        let message = panic_message(panic.as_ref());
                                        error!(
                                            plugin_id = %worker_id,
                                            function = %function,
                                            panic = %message,
                                            "Plugin call panicked, stopping runtime"
                                        );
                                        let _ = resp.send(Err(PluginError::new(
                                            worker_id.clone(),
                                            function,
                                            format!("panic: {}", message),
                                        )
                                        .panic()));
                                        // The isolate may be inconsistent after unwinding
                                        break;
                                    }
                                }
                            }
                        }
                    }

                    info!(plugin_id = %worker_id, "JS worker thread exiting");
                });
            })
            .map_err(|e| MangoError::PluginLoadError(format!("{}: failed to spawn worker thread: {}", plugin_id, e)))?;

        let interrupt = ready_rx.await.map_err(|_| {
            MangoError::PluginLoadError(format!("{}: worker exited during initialization", plugin_id))
        })??;

        Ok(Self {
            plugin_id,
            plugin_dir: plugin_dir.to_path_buf(),
            call_timeout,
            tx,
            interrupt,
            next_call: AtomicU64::new(1),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Whether the worker still accepts calls
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Call an exported function with no caller deadline
    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, PluginError> {
        self.call_with_context(&CallContext::new(), function, args).await
    }

    /// Call an exported function, giving up when `ctx` is done or the hard
    /// backstop elapses
    ///
    /// A call that is given up on is interrupted inside the runtime; results
    /// it may still produce are discarded.
    pub async fn call_with_context(
        &self,
        ctx: &CallContext,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, PluginError> {
        let error = |message: String| PluginError::new(self.plugin_id.clone(), function, message);

        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (resp_tx, resp_rx) = oneshot::channel();

        let exchange = async {
            self.tx
                .send(JsCommand::Call {
                    call_id,
                    function: function.to_string(),
                    args,
                    cancel: cancel.clone(),
                    resp: resp_tx,
                })
                .await
                .map_err(|_| error("plugin runtime is not running".to_string()))?;

            resp_rx
                .await
                .map_err(|_| error("plugin worker exited during call".to_string()).panic())?
        };

        let backstop = self.call_timeout;
        let timed_out = tokio::select! {
            result = exchange => return result,
            _ = ctx.done() => error("timeout".to_string()).timeout(),
            _ = tokio::time::sleep(backstop) => {
                error(format!("timeout after {} seconds", backstop.as_secs())).timeout()
            }
        };

        warn!(plugin_id = %self.plugin_id, function = %function, "Plugin call timed out");
        cancel.cancel();
        self.interrupt.abandon(call_id);
        Err(timed_out)
    }
}

impl Drop for JsPluginRuntime {
    fn drop(&mut self) {
        self.interrupt.abandon_current();
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
