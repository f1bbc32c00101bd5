//! Provider plugin system
//!
//! This module provides:
//! - Provider registry shared by native providers and script plugins
//! - Plugin manifests and version compatibility checks
//! - JavaScript runtime with the `mango` host API (http, log, state, utils, config)
//! - Per-plugin runtime actors and the provider adapter on top of them
//! - Lazy loading, idle unloading and hot reload through the plugin manager
//! - Repository service for installing and updating plugins

pub mod adapter;
pub mod html;
pub mod installer;
pub mod js_bindings;
pub mod js_runtime;
pub mod js_wrapper;
pub mod lazy;
pub mod manager;
pub mod manifest;
pub mod native;
pub mod registry;
pub mod state;
pub mod types;
pub mod version;
pub mod xpath;

pub use adapter::PluginProvider;
pub use installer::{PluginRepositoryService, PluginUpdateInfo, RepositoryManifest, RepositoryPlugin};
pub use js_bindings::{create_js_runtime_with_bindings, HostContext};
pub use js_runtime::{JsRuntimeWrapper, RuntimeLimits};
pub use js_wrapper::{CallContext, JsPluginRuntime};
pub use lazy::LazyPluginProvider;
pub use manager::{PluginInfo, PluginManagement, PluginManager};
pub use manifest::{load_manifest, PluginManifest};
pub use native::MockadexProvider;
pub use registry::ProviderRegistry;
pub use state::StateStore;
pub use types::{ChapterResult, Provider, ProviderInfo, SearchResult};
pub use version::{compare_versions, is_newer_version, validate_api_version, API_VERSION};
