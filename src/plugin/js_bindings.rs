//! Host API exposed to script plugins
//!
//! Builds a Deno Core runtime whose global `mango` object gives plugins
//! HTTP, structured logging, persistent state, HTML parsing helpers and
//! read-only configuration. Everything crosses the boundary through the ops
//! below; the JavaScript side is a thin wrapper defined in `PRELUDE`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use deno_core::{op2, Extension, JsRuntime, Op, OpState, RuntimeOptions};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, REFERER};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::html::{ElementInfo, HtmlDocuments, SelectRequest, XPathNode, XPathRequest};
use super::js_wrapper::panic_message;
use super::state::StateStore;

/// Default timeout of `mango.http` requests
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Logger handed to scripts through `mango.log`
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: String,
}

impl PluginLogger {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
        }
    }

    pub fn log(&self, level: &str, message: &str) {
        match level {
            "debug" => debug!(plugin = %self.plugin_id, "{}", message),
            "warn" => warn!(plugin = %self.plugin_id, "{}", message),
            "error" => error!(plugin = %self.plugin_id, "{}", message),
            _ => info!(plugin = %self.plugin_id, "{}", message),
        }
    }
}

/// Host-side resources of one plugin runtime, stored in the op state
pub struct HostContext {
    pub plugin_id: String,
    pub logger: PluginLogger,
    pub state: Arc<StateStore>,
    pub http_timeout: Duration,
}

impl HostContext {
    pub fn new(plugin_id: &str, state: Arc<StateStore>, http_timeout: Duration) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            logger: PluginLogger::new(plugin_id),
            state,
            http_timeout,
        }
    }
}

/// Cancellation token of the call currently running in the runtime
///
/// Replaced before every call; blocking host operations give up once it
/// fires.
#[derive(Clone, Default)]
pub struct ActiveCall(pub CancellationToken);

// ============================================================================
// HTTP
// ============================================================================

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
static IO_RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

fn get_client() -> &'static reqwest::Client {
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("mango-plugins/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build global reqwest client")
    })
}

/// Requests are driven here while the script thread blocks on the answer
fn io_runtime() -> &'static tokio::runtime::Runtime {
    IO_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mango-plugin-http")
            .enable_all()
            .build()
            .expect("Failed to build plugin HTTP runtime")
    })
}

/// Request issued by `mango.http.get` / `mango.http.post`
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Seconds; overrides the host default
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    /// Decoded JSON, or the raw body when it is not JSON
    pub data: Value,
    pub body: String,
}

/// Perform one plugin HTTP request
pub async fn perform_http(
    client: &reqwest::Client,
    req: HttpRequest,
    default_timeout: Duration,
) -> Result<HttpResponse> {
    let method = req.method.to_uppercase();
    if req.url.is_empty() {
        bail!("HTTP {} error: URL is required", method);
    }

    let timeout = req
        .timeout
        .filter(|secs| secs.is_finite() && *secs > 0.0 && *secs < 86_400.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default_timeout);

    let mut headers = HeaderMap::new();
    let mut builder = match method.as_str() {
        "GET" => client.get(&req.url),
        "POST" => {
            let builder = client.post(&req.url);
            match req.body {
                Some(Value::String(text)) => {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                    builder.body(text)
                }
                Some(other) => {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    builder.body(serde_json::to_vec(&other)?)
                }
                None => {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    builder
                }
            }
        }
        other => bail!("HTTP error: unsupported method {}", other),
    };

    for (name, value) in req.headers.unwrap_or_default() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("HTTP {} error: invalid header name {:?}", method, name))?;
        let value = HeaderValue::from_str(&value)
            .with_context(|| format!("HTTP {} error: invalid value for header {}", method, name))?;
        headers.insert(name, value);
    }

    if method == "GET" && !headers.contains_key(REFERER) {
        if let Ok(referer) = HeaderValue::from_str(&req.url) {
            headers.insert(REFERER, referer);
        }
    }

    builder = builder.headers(headers).timeout(timeout);

    let resp = builder
        .send()
        .await
        .map_err(|e| anyhow!("HTTP {} error: request to '{}' failed: {}", method, req.url, e))?;

    let status = resp.status();
    let mut response_headers = HashMap::new();
    for (name, value) in resp.headers() {
        if let Ok(value) = value.to_str() {
            response_headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let body = resp.text().await.map_err(|e| {
        anyhow!(
            "HTTP {} error: failed to read response body from '{}': {}",
            method,
            req.url,
            e
        )
    })?;
    let data = serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body.clone()));

    Ok(HttpResponse {
        status: status.as_u16(),
        status_text: format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or(""))
            .trim_end()
            .to_string(),
        headers: response_headers,
        data,
        body,
    })
}

/// Run a request to completion from the (synchronous) script thread
fn blocking_http(
    req: HttpRequest,
    default_timeout: Duration,
    cancel: CancellationToken,
) -> Result<HttpResponse> {
    let method = req.method.to_uppercase();
    let url = req.url.clone();

    let task = io_runtime().spawn(perform_http(get_client(), req, default_timeout));
    let abort = task.abort_handle();

    // Unconstrained: the script thread's task budget may already be spent
    futures::executor::block_on(tokio::task::unconstrained(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                Err(anyhow!("HTTP {} error: request to '{}' cancelled", method, url))
            }
            joined = task => joined.unwrap_or_else(|_| {
                Err(anyhow!("HTTP {} error: request to '{}' was aborted", method, url))
            }),
        }
    }))
}

/// Turn a panic in host code into an error thrown to the script
///
/// Ops are entered from V8 callbacks, which a panic must not unwind through.
fn catch_op_panic<T>(op: &str, body: impl FnOnce() -> Result<T>) -> Result<T> {
    std::panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!(op = %op, panic = %message, "Host operation panicked");
        Err(anyhow!("{} error: host panic: {}", op, message))
    })
}

#[op2]
#[serde]
fn op_mango_http(state: &mut OpState, #[serde] req: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
    let (timeout, plugin_id) = {
        let host = state.borrow::<HostContext>();
        (host.http_timeout, host.plugin_id.clone())
    };
    let cancel = state
        .try_borrow::<ActiveCall>()
        .map(|call| call.0.clone())
        .unwrap_or_default();

    debug!(plugin_id = %plugin_id, method = %req.method, url = %req.url, "Plugin HTTP request");
    catch_op_panic("HTTP", || blocking_http(req, timeout, cancel))
}

// ============================================================================
// Logging, state and utilities
// ============================================================================

#[derive(Debug, Deserialize)]
struct LogEntry {
    level: String,
    message: String,
}

#[op2]
fn op_mango_log(state: &mut OpState, #[serde] entry: LogEntry) {
    state.borrow::<HostContext>().logger.log(&entry.level, &entry.message);
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum StateCommand {
    Get { key: String },
    Set { key: String, value: Value },
    GetAll,
    Clear,
}

/// `get` answers `{ value }` for present keys and `null` for missing ones
#[op2]
#[serde]
fn op_mango_state(state: &mut OpState, #[serde] cmd: StateCommand) -> serde_json::Value {
    let store = &state.borrow::<HostContext>().state;
    match cmd {
        StateCommand::Get { key } => match store.get(&key) {
            Some(value) => serde_json::json!({ "value": value }),
            None => Value::Null,
        },
        StateCommand::Set { key, value } => {
            store.set(&key, value);
            Value::Null
        }
        StateCommand::GetAll => Value::Object(store.get_all()),
        StateCommand::Clear => {
            store.clear();
            Value::Null
        }
    }
}

/// Replace characters that are invalid in file names with `-`
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            other => other,
        })
        .collect()
}

#[op2]
#[string]
fn op_mango_sanitize_filename(#[string] name: String) -> String {
    sanitize_filename(&name)
}

#[op2(async)]
async fn op_mango_sleep(ms: f64) {
    let ms = if ms.is_finite() && ms > 0.0 { ms as u64 } else { 0 };
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ============================================================================
// HTML
// ============================================================================

#[op2(fast)]
fn op_mango_html_parse(state: &mut OpState, #[string] html: String) -> Result<u32, anyhow::Error> {
    let docs = state.borrow_mut::<HtmlDocuments>();
    catch_op_panic("parseHTML", || Ok(docs.parse(&html)))
}

#[op2]
#[serde]
fn op_mango_html_select(
    state: &mut OpState,
    #[serde] req: SelectRequest,
) -> Result<Vec<ElementInfo>, anyhow::Error> {
    let docs = state.borrow::<HtmlDocuments>();
    catch_op_panic("querySelector", || {
        docs.select(&req).map_err(|e| anyhow!("querySelector error: {}", e))
    })
}

#[op2]
#[serde]
fn op_mango_html_xpath(
    state: &mut OpState,
    #[serde] req: XPathRequest,
) -> Result<Vec<XPathNode>, anyhow::Error> {
    let docs = state.borrow::<HtmlDocuments>();
    catch_op_panic("xpath", || docs.xpath(&req).map_err(|e| anyhow!("xpath error: {}", e)))
}

/// JavaScript half of the host API
///
/// `__MANGO_PLUGIN_ID__` and `__MANGO_CONFIG__` are substituted with JSON
/// literals before execution.
const PRELUDE: &str = r#"
"use strict";
((ops) => {
  const pluginId = __MANGO_PLUGIN_ID__;

  const deepFreeze = (value) => {
    if (value !== null && typeof value === "object" && !Object.isFrozen(value)) {
      Object.freeze(value);
      Object.values(value).forEach(deepFreeze);
    }
    return value;
  };

  const show = (value) => {
    if (typeof value === "string") return value;
    if (value instanceof Error) return String(value);
    try {
      const json = JSON.stringify(value);
      return json === undefined ? String(value) : json;
    } catch (_) {
      return String(value);
    }
  };

  const describeError = (err) => {
    if (err === undefined || err === null) return "";
    return show(err);
  };

  const makeLogger = (level) => (...args) =>
    ops.op_mango_log({ level, message: args.map(show).join(" ") });

  const log = Object.freeze({
    debug: makeLogger("debug"),
    info: makeLogger("info"),
    warn: makeLogger("warn"),
    error: makeLogger("error"),
  });

  const normalizeHeaders = (headers) => {
    if (headers === undefined || headers === null) return null;
    const out = {};
    for (const [key, value] of Object.entries(headers)) out[key] = String(value);
    return out;
  };

  const timeoutOf = (options) => {
    const t = options && options.timeout;
    return typeof t === "number" ? t : null;
  };

  const wrapResponse = (raw) => Object.freeze({
    status: raw.status,
    statusText: raw.statusText,
    headers: raw.headers,
    data: raw.data,
    text: () => raw.body,
  });

  const http = Object.freeze({
    get(url, options) {
      return wrapResponse(ops.op_mango_http({
        method: "GET",
        url: url === undefined || url === null ? "" : String(url),
        headers: normalizeHeaders(options && options.headers),
        body: null,
        timeout: timeoutOf(options),
      }));
    },
    post(url, body, options) {
      return wrapResponse(ops.op_mango_http({
        method: "POST",
        url: url === undefined || url === null ? "" : String(url),
        headers: normalizeHeaders(options && options.headers),
        body: body === undefined ? null : body,
        timeout: timeoutOf(options),
      }));
    },
  });

  const state = Object.freeze({
    get(key) {
      const slot = ops.op_mango_state({ op: "get", key: String(key) });
      return slot === null ? undefined : slot.value;
    },
    set(key, value) {
      ops.op_mango_state({ op: "set", key: String(key), value: value === undefined ? null : value });
    },
    getAll() {
      return ops.op_mango_state({ op: "getAll" });
    },
    clear() {
      ops.op_mango_state({ op: "clear" });
    },
  });

  const select = (doc, node, selector, all) =>
    ops.op_mango_html_select({ doc, node, selector: String(selector), all })
      .map((info) => makeElement(doc, info));

  const xpathQuery = (doc, node, expr) =>
    ops.op_mango_html_xpath({ doc, node, expr: String(expr) })
      .map((item) => (item.nodeType === "element" ? makeElement(doc, item) : Object.freeze(item)));

  const makeElement = (doc, info) => Object.freeze({
    nodeType: "element",
    tagName: info.tagName,
    textContent: info.textContent,
    innerHTML: info.innerHTML,
    outerHTML: info.outerHTML,
    attributes: Object.freeze(info.attributes),
    getAttribute: (name) =>
      Object.prototype.hasOwnProperty.call(info.attributes, name) ? info.attributes[name] : null,
    querySelector: (selector) => select(doc, info.node, selector, false)[0] ?? null,
    querySelectorAll: (selector) => select(doc, info.node, selector, true),
    xpath: (expr) => xpathQuery(doc, info.node, expr),
  });

  const parseHTML = (html) => {
    const doc = ops.op_mango_html_parse(html === undefined || html === null ? "" : String(html));
    return Object.freeze({
      querySelector: (selector) => select(doc, 0, selector, false)[0] ?? null,
      querySelectorAll: (selector) => select(doc, 0, selector, true),
      xpath: (expr) => xpathQuery(doc, 0, expr),
    });
  };

  const requireQueryable = (fn, target) => {
    if (target === null || typeof target !== "object" || typeof target[fn] !== "function") {
      throw new Error(`${fn} error: invalid document object`);
    }
    return target;
  };

  const utils = Object.freeze({
    sanitizeFilename: (name) => ops.op_mango_sanitize_filename(String(name)),
    parseHTML,
    querySelector: (doc, selector) => requireQueryable("querySelector", doc).querySelector(selector),
    querySelectorAll: (doc, selector) => requireQueryable("querySelectorAll", doc).querySelectorAll(selector),
    xpath: (docOrHtml, expr) => {
      if (expr === undefined || expr === null || expr === "") {
        throw new Error("xpath error: HTML string and XPath expression are required");
      }
      const doc = typeof docOrHtml === "string" ? parseHTML(docOrHtml) : docOrHtml;
      return requireQueryable("xpath", doc).xpath(expr);
    },
    sleep: (ms) => ops.op_mango_sleep(Number(ms) || 0),
  });

  const mango = Object.freeze({
    pluginId,
    http,
    log,
    state,
    utils,
    config: deepFreeze(__MANGO_CONFIG__),
  });

  Object.defineProperty(globalThis, "mango", { value: mango, enumerable: true });

  if (typeof globalThis.console === "undefined") {
    globalThis.console = {};
  }
  globalThis.console.log = log.info;
  globalThis.console.info = log.info;
  globalThis.console.debug = log.debug;
  globalThis.console.warn = log.warn;
  globalThis.console.error = log.error;

  globalThis.exports = {};

  // Invoked by the host for every call; returns a slot the host polls until
  // it is no longer pending.
  Object.defineProperty(globalThis, "__mangoInvoke", {
    value: (name, args) => {
      const slot = { state: "pending", json: undefined, error: undefined };
      const fulfil = (value) => {
        try {
          slot.json = JSON.stringify(value === undefined ? null : value);
          slot.state = "fulfilled";
        } catch (err) {
          slot.error = describeError(err);
          slot.state = "thrown";
        }
      };

      let result;
      try {
        result = globalThis.exports[name](...args, mango);
      } catch (err) {
        slot.error = describeError(err);
        slot.state = "thrown";
        return slot;
      }

      const thenable = result !== null
        && (typeof result === "object" || typeof result === "function")
        && typeof result.then === "function";
      if (!thenable) {
        fulfil(result);
        return slot;
      }

      try {
        result.then(fulfil, (reason) => {
          slot.error = describeError(reason);
          slot.state = "rejected";
        });
      } catch (err) {
        slot.error = describeError(err);
        slot.state = "rejected";
      }
      return slot;
    },
  });
})(Deno.core.ops);
"#;

/// Create a JavaScript runtime with the `mango` host API installed
///
/// # Arguments
/// * `host` - Host resources of the plugin (logger, state, HTTP settings)
/// * `config` - Resolved configuration exposed as `mango.config`
pub fn create_js_runtime_with_bindings(host: HostContext, config: &Map<String, Value>) -> Result<JsRuntime> {
    let ext = Extension {
        name: "mango_host",
        ops: std::borrow::Cow::Borrowed(&[
            op_mango_http::DECL,
            op_mango_log::DECL,
            op_mango_state::DECL,
            op_mango_sanitize_filename::DECL,
            op_mango_sleep::DECL,
            op_mango_html_parse::DECL,
            op_mango_html_select::DECL,
            op_mango_html_xpath::DECL,
        ]),
        ..Default::default()
    };

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![ext],
        ..Default::default()
    });

    let init_code = PRELUDE
        .replace("__MANGO_PLUGIN_ID__", &serde_json::to_string(&host.plugin_id)?)
        .replace("__MANGO_CONFIG__", &serde_json::to_string(config)?);

    {
        let op_state = runtime.op_state();
        let mut op_state = op_state.borrow_mut();
        op_state.put(host);
        op_state.put(HtmlDocuments::new());
        op_state.put(ActiveCall::default());
    }

    runtime
        .execute_script("<mango_host_api>", init_code.into())
        .context("Failed to initialize the mango host API")?;

    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn host(dir: &TempDir) -> HostContext {
        HostContext::new(
            "test-plugin",
            Arc::new(StateStore::open(dir.path())),
            DEFAULT_HTTP_TIMEOUT,
        )
    }

    fn runtime(dir: &TempDir, config: Value) -> JsRuntime {
        let config = config.as_object().cloned().unwrap_or_default();
        create_js_runtime_with_bindings(host(dir), &config).unwrap()
    }

    /// Evaluate an expression and return its JSON value
    fn eval_json(runtime: &mut JsRuntime, expr: &str) -> Value {
        let code = format!("JSON.stringify((() => {{ {} }})())", expr);
        let result = runtime.execute_script("<test>", code.into()).unwrap();
        let scope = &mut runtime.handle_scope();
        let local = deno_core::v8::Local::new(scope, result);
        let text = local.to_string(scope).unwrap().to_rust_string_lossy(scope);
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename(r#"a/b\c:d*e?f"g<h>i|j"#), "a-b-c-d-e-f-g-h-i-j");
        assert_eq!(sanitize_filename("Chapter 1"), "Chapter 1");
    }

    #[test]
    fn test_host_api_shape() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let shape = eval_json(
            &mut rt,
            r#"return {
                http: typeof mango.http.get + typeof mango.http.post,
                log: Object.keys(mango.log).sort(),
                state: Object.keys(mango.state).sort(),
                utils: Object.keys(mango.utils).sort(),
                id: mango.pluginId,
            };"#,
        );
        assert_eq!(shape["http"], "functionfunction");
        assert_eq!(shape["log"], json!(["debug", "error", "info", "warn"]));
        assert_eq!(shape["state"], json!(["clear", "get", "getAll", "set"]));
        assert_eq!(
            shape["utils"],
            json!(["parseHTML", "querySelector", "querySelectorAll", "sanitizeFilename", "sleep", "xpath"])
        );
        assert_eq!(shape["id"], "test-plugin");
    }

    #[test]
    fn test_config_is_read_only() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({ "language": "en", "nested": { "pageSize": 20 } }));
        let result = eval_json(
            &mut rt,
            r#"
            "use strict";
            let threwTop = false;
            let threwNested = false;
            let threwReplace = false;
            try { mango.config.language = "fr"; } catch (_) { threwTop = true; }
            try { mango.config.nested.pageSize = 1; } catch (_) { threwNested = true; }
            try { mango.config = {}; } catch (_) { threwReplace = true; }
            return {
              language: mango.config.language,
              pageSize: mango.config.nested.pageSize,
              threw: threwTop && threwNested && threwReplace,
            };
            "#,
        );
        assert_eq!(result["language"], "en");
        assert_eq!(result["pageSize"], 20);
        assert_eq!(result["threw"], true);
    }

    #[test]
    fn test_state_round_trip_through_script() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path()));
        let host = HostContext::new("test-plugin", store.clone(), DEFAULT_HTTP_TIMEOUT);
        let mut rt = create_js_runtime_with_bindings(host, &Map::new()).unwrap();

        let result = eval_json(
            &mut rt,
            r#"
            const missing = mango.state.get("cursor");
            mango.state.set("cursor", { page: 2 });
            mango.state.set("seen", ["a", "b"]);
            return { missing: missing === undefined, cursor: mango.state.get("cursor"), all: mango.state.getAll() };
            "#,
        );
        assert_eq!(result["missing"], true);
        assert_eq!(result["cursor"], json!({ "page": 2 }));
        assert_eq!(result["all"]["seen"], json!(["a", "b"]));

        assert!(store.is_dirty());
        assert_eq!(store.get("cursor"), Some(json!({ "page": 2 })));

        eval_json(&mut rt, "mango.state.clear(); return null;");
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn test_logging_accepts_any_values() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let result = eval_json(
            &mut rt,
            r#"
            mango.log.info("found", 3, "chapters", { id: 1 });
            mango.log.debug(null, undefined);
            mango.log.warn(new Error("careful"));
            mango.log.error("failed");
            console.log("console is routed too");
            return "ok";
            "#,
        );
        assert_eq!(result, "ok");
    }

    #[test]
    fn test_parse_html_and_query() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let result = eval_json(
            &mut rt,
            r#"
            const doc = mango.utils.parseHTML(`
              <ul>
                <li class="ch" data-id="1"><a href="/c/1">One</a></li>
                <li class="ch" data-id="2"><a href="/c/2">Two</a></li>
              </ul>`);
            const items = doc.querySelectorAll("li.ch");
            const first = doc.querySelector("li.ch a");
            const viaUtils = mango.utils.querySelectorAll(doc, "a").length;
            return {
              count: items.length,
              tag: first.tagName,
              text: first.textContent,
              href: first.getAttribute("href"),
              missingAttr: first.getAttribute("title"),
              nested: items[1].querySelector("a").textContent,
              none: doc.querySelector("table"),
              viaUtils,
            };
            "#,
        );
        assert_eq!(result["count"], 2);
        assert_eq!(result["tag"], "A");
        assert_eq!(result["text"], "One");
        assert_eq!(result["href"], "/c/1");
        assert_eq!(result["missingAttr"], Value::Null);
        assert_eq!(result["nested"], "Two");
        assert_eq!(result["none"], Value::Null);
        assert_eq!(result["viaUtils"], 2);
    }

    #[test]
    fn test_xpath_from_document_element_and_string() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let result = eval_json(
            &mut rt,
            r#"
            const html = `<div><p class="t">Title</p><a href="/x">link</a></div>`;
            const doc = mango.utils.parseHTML(html);
            const attr = doc.xpath("//a/@href")[0];
            const text = mango.utils.xpath(html, "//p/text()")[0];
            const el = mango.utils.xpath(doc, "//div")[0];
            const scoped = el.xpath("./p")[0];
            return { attr, text, elTag: el.tagName, scoped: scoped.textContent };
            "#,
        );
        assert_eq!(result["attr"], json!({ "nodeType": "attribute", "name": "href", "value": "/x" }));
        assert_eq!(result["text"], json!({ "nodeType": "text", "textContent": "Title" }));
        assert_eq!(result["elTag"], "DIV");
        assert_eq!(result["scoped"], "Title");
    }

    #[test]
    fn test_invalid_selector_throws_script_error() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let result = eval_json(
            &mut rt,
            r#"
            try {
              mango.utils.parseHTML("<p></p>").querySelector("p[");
              return "no error";
            } catch (e) {
              return String(e);
            }
            "#,
        );
        assert!(result.as_str().unwrap().contains("querySelector error"));
    }

    #[test]
    fn test_deeply_nested_queries_throw_script_errors() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let result = eval_json(
            &mut rt,
            r#"
            const doc = mango.utils.parseHTML("<p>x</p>");
            const attempt = (fn) => { try { fn(); return "no error"; } catch (e) { return String(e); } };
            return {
              xpath: attempt(() => doc.xpath("//p[" + "(".repeat(2000) + "1" + ")".repeat(2000) + "]")),
              selector: attempt(() => doc.querySelector(":not(".repeat(100000) + "p" + ")".repeat(100000))),
              after: doc.querySelector("p").textContent,
            };
            "#,
        );
        assert!(result["xpath"].as_str().unwrap().contains("xpath error"), "{}", result["xpath"]);
        assert!(result["selector"].as_str().unwrap().contains("querySelector error"), "{}", result["selector"]);
        assert_eq!(result["after"], "x");
    }

    #[test]
    fn test_op_panic_becomes_error() {
        let err = catch_op_panic::<()>("xpath", || panic!("index out of bounds")).unwrap_err();
        assert_eq!(err.to_string(), "xpath error: host panic: index out of bounds");

        let value = catch_op_panic("xpath", || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_http_get_from_script() {
        let mut server = mockito::Server::new();
        let url = format!("{}/series", server.url());
        let mock = server
            .mock("GET", "/series")
            .match_header("referer", url.as_str())
            .match_header("x-token", "abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[1,2,3]}"#)
            .create();

        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let result = eval_json(
            &mut rt,
            &format!(
                r#"
                const res = mango.http.get("{}", {{ headers: {{ "X-Token": "abc" }}, timeout: 5 }});
                return {{ status: res.status, statusText: res.statusText, items: res.data.items, raw: res.text(), ct: res.headers["content-type"] }};
                "#,
                url
            ),
        );

        mock.assert();
        assert_eq!(result["status"], 200);
        assert_eq!(result["statusText"], "200 OK");
        assert_eq!(result["items"], json!([1, 2, 3]));
        assert_eq!(result["raw"], r#"{"items":[1,2,3]}"#);
        assert_eq!(result["ct"], "application/json");
    }

    #[test]
    fn test_http_failure_throws() {
        let dir = TempDir::new().unwrap();
        let mut rt = runtime(&dir, json!({}));
        let result = eval_json(
            &mut rt,
            r#"
            try { mango.http.get(""); return "no error"; } catch (e) { return String(e); }
            "#,
        );
        assert!(result.as_str().unwrap().contains("HTTP GET error: URL is required"));
    }

    #[tokio::test]
    async fn test_perform_http_post_string_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/search")
            .match_header("content-type", "text/plain")
            .match_body("query=berserk")
            .with_status(201)
            .with_body("created")
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let resp = perform_http(
            &client,
            HttpRequest {
                method: "POST".to_string(),
                url: format!("{}/search", server.url()),
                headers: None,
                body: Some(json!("query=berserk")),
                timeout: None,
            },
            DEFAULT_HTTP_TIMEOUT,
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.status, 201);
        // Non-JSON bodies fall back to text
        assert_eq!(resp.data, json!("created"));
        assert_eq!(resp.body, "created");
    }

    #[tokio::test]
    async fn test_perform_http_post_json_body_and_header_override() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/graphql")
            .match_header("content-type", "application/vnd.api+json")
            .match_body(mockito::Matcher::Json(json!({ "q": "one piece", "page": 1 })))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/vnd.api+json".to_string());
        let resp = perform_http(
            &client,
            HttpRequest {
                method: "post".to_string(),
                url: format!("{}/graphql", server.url()),
                headers: Some(headers),
                body: Some(json!({ "q": "one piece", "page": 1 })),
                timeout: Some(5.0),
            },
            DEFAULT_HTTP_TIMEOUT,
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.data, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_perform_http_connection_error() {
        let client = reqwest::Client::new();
        let err = perform_http(
            &client,
            HttpRequest {
                method: "GET".to_string(),
                url: "http://127.0.0.1:1/unreachable".to_string(),
                headers: None,
                body: None,
                timeout: Some(2.0),
            },
            DEFAULT_HTTP_TIMEOUT,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("HTTP GET error: request to 'http://127.0.0.1:1/unreachable' failed"));
    }

    #[test]
    fn test_blocking_http_cancelled_mid_request() {
        use std::io::Write;

        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", "/slow")
            .with_status(200)
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_secs(3));
                w.write_all(b"late")
            })
            .create();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = blocking_http(
            HttpRequest {
                method: "GET".to_string(),
                url: format!("{}/slow", server.url()),
                headers: None,
                body: None,
                timeout: Some(20.0),
            },
            DEFAULT_HTTP_TIMEOUT,
            cancel,
        )
        .unwrap_err();

        assert!(err.to_string().contains("cancelled"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_blocking_http_gives_up_when_call_is_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Non-routable address: the connect would hang until the timeout
        let err = blocking_http(
            HttpRequest {
                method: "GET".to_string(),
                url: "http://10.255.255.1/slow".to_string(),
                headers: None,
                body: None,
                timeout: Some(20.0),
            },
            DEFAULT_HTTP_TIMEOUT,
            cancel,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cancelled") || err.to_string().contains("failed"));
    }
}
