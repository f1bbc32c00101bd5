//! JavaScript Runtime Module
//!
//! One `JsRuntimeWrapper` owns the Deno Core runtime of a single plugin: it
//! installs the host API, evaluates the entry script in a CommonJS-style
//! wrapper and invokes exported functions, pumping the event loop until
//! returned promises settle.
//!
//! The wrapper is not `Send`; it lives on the plugin's worker thread (see
//! `js_wrapper`).

use std::future::poll_fn;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use deno_core::{v8, JsRuntime};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::html::HtmlDocuments;
use super::js_bindings::{create_js_runtime_with_bindings, ActiveCall, HostContext, DEFAULT_HTTP_TIMEOUT};
use super::manifest::PluginManifest;
use super::state::{StateFlusher, StateStore, DEFAULT_FLUSH_INTERVAL};
use crate::core::config::PluginsConfig;
use crate::core::error::{MangoError, PluginError};

/// Exports every plugin script must define
pub const REQUIRED_EXPORTS: [&str; 4] = ["getInfo", "search", "getChapters", "getPageURLs"];

/// Per-runtime time bounds
#[derive(Debug, Clone)]
pub struct RuntimeLimits {
    /// Hard backstop of a whole call, enforced by the caller
    pub call_timeout: Duration,
    /// How long a returned promise may stay pending
    pub promise_timeout: Duration,
    pub http_timeout: Duration,
    pub state_flush_interval: Duration,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            promise_timeout: Duration::from_secs(30),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            state_flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl From<&PluginsConfig> for RuntimeLimits {
    fn from(config: &PluginsConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            promise_timeout: config.promise_timeout(),
            http_timeout: config.http_timeout(),
            state_flush_interval: config.state_flush_interval(),
        }
    }
}

/// Outcome recorded by the script-side invoke helper
enum Slot {
    Pending,
    Fulfilled(String),
    Thrown(String),
    Rejected(String),
}

/// How driving the event loop ended
enum Pump {
    Settled,
    Failed(String),
    TimedOut,
    Cancelled,
}

/// JavaScript runtime of one plugin
pub struct JsRuntimeWrapper {
    plugin_id: String,
    entry_path: PathBuf,
    limits: RuntimeLimits,
    /// Dropped before the flusher so the last flush sees every write
    runtime: JsRuntime,
    state: Arc<StateStore>,
    _flusher: StateFlusher,
}

impl JsRuntimeWrapper {
    /// Create the runtime and evaluate the plugin's entry script
    ///
    /// Fails if the script cannot be read or executed, or if it does not
    /// define every export in `REQUIRED_EXPORTS`.
    pub fn new(plugin_dir: &Path, manifest: &PluginManifest, limits: RuntimeLimits) -> Result<Self, MangoError> {
        let load_error = |msg: String| MangoError::PluginLoadError(format!("{}: {}", manifest.id, msg));

        debug!(plugin_id = %manifest.id, "Creating JavaScript runtime");

        let state = Arc::new(StateStore::open(plugin_dir));
        let flusher = StateFlusher::spawn(state.clone(), &manifest.id, limits.state_flush_interval)
            .map_err(|e| load_error(format!("failed to start state flusher: {}", e)))?;

        let host = HostContext::new(&manifest.id, state.clone(), limits.http_timeout);
        let runtime = create_js_runtime_with_bindings(host, &manifest.config_defaults())
            .map_err(|e| load_error(format!("{:#}", e)))?;

        let mut wrapper = Self {
            plugin_id: manifest.id.clone(),
            entry_path: plugin_dir.join(&manifest.entry_point),
            limits,
            runtime,
            state,
            _flusher: flusher,
        };
        wrapper.load_module().map_err(load_error)?;
        Ok(wrapper)
    }

    fn load_module(&mut self) -> Result<(), String> {
        info!(
            plugin_id = %self.plugin_id,
            path = %self.entry_path.display(),
            "Loading plugin script"
        );

        let code = std::fs::read_to_string(&self.entry_path)
            .map_err(|e| format!("failed to read plugin script {}: {}", self.entry_path.display(), e))?;

        let wrapped = format!("(function (exports) {{\n{}\n}})(globalThis.exports);", code);
        self.runtime
            .execute_script("<plugin_module>", wrapped.into())
            .map_err(|e| format!("failed to execute plugin script: {}", e))?;

        for name in REQUIRED_EXPORTS {
            if !self.export_defined(name) {
                return Err(format!("plugin missing required export: {}", name));
            }
        }

        debug!(plugin_id = %self.plugin_id, "Plugin script loaded");
        Ok(())
    }

    fn export_defined(&mut self, name: &str) -> bool {
        let scope = &mut self.runtime.handle_scope();
        match get_export(scope, name) {
            Some(value) => !value.is_undefined(),
            None => false,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Handle that can interrupt running script from another thread
    pub fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Call an exported function with JSON arguments
    ///
    /// The `mango` host object is passed after `args`. Promises are awaited
    /// up to the promise timeout, or until `cancel` fires.
    pub async fn call_function(
        &mut self,
        function: &str,
        args: &[Value],
        cancel: CancellationToken,
    ) -> Result<Value, PluginError> {
        debug!(plugin_id = %self.plugin_id, function = %function, "Calling plugin function");

        self.runtime.op_state().borrow_mut().put(ActiveCall(cancel.clone()));
        let result = self.invoke_and_settle(function, args, &cancel).await;

        // Documents never outlive the call that parsed them
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<HtmlDocuments>()
            .clear();

        result
    }

    async fn invoke_and_settle(
        &mut self,
        function: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Value, PluginError> {
        let plugin_id = self.plugin_id.clone();
        let error = |message: &str| PluginError::new(plugin_id.clone(), function, message);

        let slot = match self.invoke(function, args) {
            Ok(slot) => slot,
            Err((message, true)) => return Err(error(&message).timeout()),
            Err((message, false)) => return Err(error(&message)),
        };

        if let Some(result) = self.settled(&slot, function) {
            return result;
        }

        let promise_timeout = self.limits.promise_timeout;
        let outcome = {
            let runtime = &mut self.runtime;
            let pump = poll_fn(|cx| match runtime.poll_event_loop(cx, Default::default()) {
                Poll::Ready(result) => Poll::Ready(result),
                Poll::Pending if !matches!(read_slot(runtime, &slot), Slot::Pending) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            });

            tokio::select! {
                pumped = tokio::time::timeout(promise_timeout, pump) => match pumped {
                    Ok(Ok(())) => Pump::Settled,
                    Ok(Err(e)) => Pump::Failed(e.to_string()),
                    Err(_) => Pump::TimedOut,
                },
                _ = cancel.cancelled() => Pump::Cancelled,
            }
        };

        match outcome {
            Pump::TimedOut => Err(error("promise timeout").timeout()),
            Pump::Cancelled => Err(error("timeout").timeout()),
            Pump::Failed(message) => {
                let err = error(&format!("execution error: {}", message));
                if self.runtime.v8_isolate().is_execution_terminating() {
                    Err(err.timeout())
                } else {
                    Err(err)
                }
            }
            // Either the slot settled or the loop went idle without settling it
            Pump::Settled => self
                .settled(&slot, function)
                .unwrap_or_else(|| Err(error("promise never settled"))),
        }
    }

    /// Start the call; returns the result slot or `(message, terminated)`
    fn invoke(&mut self, function: &str, args: &[Value]) -> Result<v8::Global<v8::Object>, (String, bool)> {
        let args_json = serde_json::to_string(args).map_err(|e| (format!("invalid arguments: {}", e), false))?;

        let scope = &mut self.runtime.handle_scope();

        let export = get_export(scope, function).filter(|v| !v.is_undefined() && !v.is_null());
        match export {
            None => return Err((format!("function {} not found", function), false)),
            Some(value) if !value.is_function() => {
                return Err((format!("function {} is not callable", function), false));
            }
            Some(_) => {}
        }

        let context = scope.get_current_context();
        let global = context.global(scope);
        let invoke = v8::String::new(scope, "__mangoInvoke")
            .and_then(|key| global.get(scope, key.into()))
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| ("host invoke helper missing".to_string(), false))?;

        let name = v8::String::new(scope, function).ok_or_else(|| ("invalid function name".to_string(), false))?;
        let args_text = v8::String::new(scope, &args_json).ok_or_else(|| ("arguments too large".to_string(), false))?;
        let args_value =
            v8::json::parse(scope, args_text).ok_or_else(|| ("failed to marshal arguments".to_string(), false))?;

        let tc = &mut v8::TryCatch::new(scope);
        let recv = v8::undefined(tc).into();
        match invoke.call(tc, recv, &[name.into(), args_value]) {
            Some(value) => {
                let slot = v8::Local::<v8::Object>::try_from(value)
                    .map_err(|_| ("host invoke helper returned no slot".to_string(), false))?;
                Ok(v8::Global::new(tc, slot))
            }
            None if tc.has_terminated() => Err(("execution terminated".to_string(), true)),
            None => {
                let message = tc
                    .exception()
                    .and_then(|e| e.to_string(tc))
                    .map(|s| s.to_rust_string_lossy(tc))
                    .unwrap_or_else(|| "unknown error".to_string());
                Err((format!("execution error: {}", message), false))
            }
        }
    }

    fn settled(&mut self, slot: &v8::Global<v8::Object>, function: &str) -> Option<Result<Value, PluginError>> {
        let plugin_id = self.plugin_id.clone();
        let error = |message: String| PluginError::new(plugin_id, function, message);
        match read_slot(&mut self.runtime, slot) {
            Slot::Pending => None,
            Slot::Fulfilled(json) => Some(
                serde_json::from_str(&json).map_err(|e| error(format!("invalid result: {}", e))),
            ),
            Slot::Thrown(message) => Some(Err(error(format!("execution error: {}", message)))),
            Slot::Rejected(reason) => {
                let reason = if reason.is_empty() {
                    "unknown error".to_string()
                } else {
                    reason
                };
                Some(Err(error(format!("promise rejected: {}", reason))))
            }
        }
    }
}

fn get_export<'s>(scope: &mut v8::HandleScope<'s>, name: &str) -> Option<v8::Local<'s, v8::Value>> {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let exports_key = v8::String::new(scope, "exports")?;
    let exports = global.get(scope, exports_key.into())?;
    let exports = v8::Local::<v8::Object>::try_from(exports).ok()?;
    let key = v8::String::new(scope, name)?;
    exports.get(scope, key.into())
}

fn read_slot(runtime: &mut JsRuntime, slot: &v8::Global<v8::Object>) -> Slot {
    let scope = &mut runtime.handle_scope();
    let object = v8::Local::new(scope, slot);

    let mut get_string = |key: &str| -> Option<String> {
        let key = v8::String::new(scope, key)?;
        let value = object.get(scope, key.into())?;
        if value.is_undefined() || value.is_null() {
            return None;
        }
        Some(value.to_string(scope)?.to_rust_string_lossy(scope))
    };

    match get_string("state").as_deref() {
        Some("fulfilled") => Slot::Fulfilled(get_string("json").unwrap_or_else(|| "null".to_string())),
        Some("thrown") => Slot::Thrown(get_string("error").unwrap_or_default()),
        Some("rejected") => Slot::Rejected(get_string("error").unwrap_or_default()),
        _ => Slot::Pending,
    }
}
