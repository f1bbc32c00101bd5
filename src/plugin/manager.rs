//! Plugin lifecycle management
//!
//! The manager discovers plugins under the plugin root, registers a lazy
//! provider for each, materializes runtimes on first use and evicts them
//! again once they have been idle for the configured timeout. It is passed
//! explicitly to whatever needs it; there is no process-wide instance.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::adapter::PluginProvider;
use super::js_runtime::RuntimeLimits;
use super::js_wrapper::JsPluginRuntime;
use super::lazy::LazyPluginProvider;
use super::manifest::{load_manifest, PluginManifest, MANIFEST_FILE};
use super::registry::ProviderRegistry;
use super::version::validate_api_version;
use crate::core::config::PluginsConfig;
use crate::core::error::{MangoError, Result};

/// Upper bound of the idle check period
const MAX_EVICTION_INTERVAL: Duration = Duration::from_secs(60);
const MIN_EVICTION_INTERVAL: Duration = Duration::from_millis(10);

/// Read-only view of a plugin for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub license: String,
    pub api_version: String,
    pub plugin_type: String,
    pub capabilities: HashMap<String, bool>,
    pub path: PathBuf,
    pub loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginInfo {
    fn from_manifest(manifest: &PluginManifest, path: &Path, loaded: bool) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            license: manifest.license.clone(),
            api_version: manifest.api_version.clone(),
            plugin_type: manifest.plugin_type.clone(),
            capabilities: manifest.capabilities.clone(),
            path: path.to_path_buf(),
            loaded,
            error: None,
        }
    }

    /// A plugin that failed discovery; uses the manifest if it still parses
    fn failed(path: &Path, error: &str) -> Self {
        let mut info = match load_manifest(path) {
            Ok(manifest) => Self::from_manifest(&manifest, path, false),
            Err(_) => {
                let id = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Self {
                    id: id.clone(),
                    name: id,
                    version: String::new(),
                    description: "Failed to load plugin".to_string(),
                    author: String::new(),
                    license: String::new(),
                    api_version: String::new(),
                    plugin_type: String::new(),
                    capabilities: HashMap::new(),
                    path: path.to_path_buf(),
                    loaded: false,
                    error: None,
                }
            }
        };
        info.error = Some(error.to_string());
        info
    }
}

/// Plugin management operations used by the repository service
#[async_trait]
pub trait PluginManagement: Send + Sync {
    /// Root directory plugins are installed into
    fn plugin_dir(&self) -> &Path;

    async fn load_plugin(&self, plugin_dir: &Path) -> Result<String>;

    async fn unload_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn reload_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn get_plugin_info(&self, plugin_id: &str) -> Option<PluginInfo>;

    async fn list_plugins(&self) -> Vec<PluginInfo>;
}

struct DiscoveredPlugin {
    manifest: PluginManifest,
    dir: PathBuf,
}

struct LoadedPlugin {
    provider: Arc<PluginProvider>,
    dir: PathBuf,
    last_access: LastAccess,
    in_flight: Arc<AtomicUsize>,
}

/// Last use of a loaded plugin, shared with its call guards
#[derive(Clone)]
struct LastAccess(Arc<Mutex<Instant>>);

impl LastAccess {
    fn now() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Instant> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn touch(&self) {
        *self.slot() = Instant::now();
    }

    fn get(&self) -> Instant {
        *self.slot()
    }
}

#[derive(Default)]
struct PluginTable {
    discovered: HashMap<String, DiscoveredPlugin>,
    loaded: HashMap<String, LoadedPlugin>,
    /// Plugin directory → error message
    failed: HashMap<PathBuf, String>,
}

/// Marks a call in flight; idle eviction skips plugins with live guards
///
/// The idle clock restarts when the call ends.
pub struct CallGuard {
    in_flight: Arc<AtomicUsize>,
    last_access: LastAccess,
}

impl CallGuard {
    fn new(in_flight: &Arc<AtomicUsize>, last_access: &LastAccess) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            in_flight: in_flight.clone(),
            last_access: last_access.clone(),
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.last_access.touch();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct ManagerInner {
    plugin_dir: PathBuf,
    unload_timeout: Duration,
    limits: RuntimeLimits,
    registry: Arc<ProviderRegistry>,
    table: RwLock<PluginTable>,
    /// Serializes materialization per plugin id
    load_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    evictor: Mutex<Option<CancellationToken>>,
}

impl ManagerInner {
    fn gate(&self, plugin_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.load_gates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        gates.entry(plugin_id.to_string()).or_default().clone()
    }

    /// Running instance of a plugin, with a guard for the call about to be made
    pub(crate) async fn acquire(self: &Arc<Self>, plugin_id: &str) -> Result<(Arc<PluginProvider>, CallGuard)> {
        // A runtime can be evicted between loading and acquiring; retry once
        for _ in 0..2 {
            if let Some((provider, Some(guard))) = self.touch_loaded(plugin_id, true).await {
                return Ok((provider, guard));
            }
            self.load_plugin_if_needed(plugin_id).await?;
        }
        Err(MangoError::PluginNotLoaded(plugin_id.to_string()))
    }

    /// Refresh the last access of a live runtime and optionally start a call
    ///
    /// Runtimes whose worker has stopped are dropped here.
    async fn touch_loaded(
        &self,
        plugin_id: &str,
        start_call: bool,
    ) -> Option<(Arc<PluginProvider>, Option<CallGuard>)> {
        let mut table = self.table.write().await;
        let alive = table
            .loaded
            .get(plugin_id)
            .map(|loaded| loaded.provider.runtime().is_alive())?;

        if !alive {
            warn!(plugin_id = %plugin_id, "Plugin runtime stopped, it will be reloaded");
            table.loaded.remove(plugin_id);
            return None;
        }

        let loaded = table.loaded.get_mut(plugin_id)?;
        loaded.last_access.touch();
        let guard = start_call.then(|| CallGuard::new(&loaded.in_flight, &loaded.last_access));
        Some((loaded.provider.clone(), guard))
    }

    async fn load_plugin_if_needed(self: &Arc<Self>, plugin_id: &str) -> Result<Arc<PluginProvider>> {
        if let Some((provider, _)) = self.touch_loaded(plugin_id, false).await {
            return Ok(provider);
        }

        let gate = self.gate(plugin_id);
        let _loading = gate.lock().await;

        // Loaded by a concurrent caller while we waited
        if let Some((provider, _)) = self.touch_loaded(plugin_id, false).await {
            return Ok(provider);
        }

        let (manifest, dir) = {
            let table = self.table.read().await;
            let discovered = table
                .discovered
                .get(plugin_id)
                .ok_or_else(|| MangoError::PluginNotFound(plugin_id.to_string()))?;
            (discovered.manifest.clone(), discovered.dir.clone())
        };

        info!(plugin_id = %plugin_id, path = %dir.display(), "Loading plugin runtime");
        let runtime = JsPluginRuntime::start(&dir, &manifest, self.limits.clone()).await?;
        let provider = Arc::new(PluginProvider::new(manifest, runtime));

        self.table.write().await.loaded.insert(
            plugin_id.to_string(),
            LoadedPlugin {
                provider: provider.clone(),
                dir,
                last_access: LastAccess::now(),
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        info!(plugin_id = %plugin_id, "Loaded plugin");

        Ok(provider)
    }

    /// Record a plugin as discovered and (re-)register its lazy provider
    async fn register_discovered(self: &Arc<Self>, manifest: PluginManifest, dir: &Path) -> Result<String> {
        let plugin_id = manifest.id.clone();

        let known = {
            let mut table = self.table.write().await;
            let known = table.discovered.contains_key(&plugin_id);
            if !known && self.registry.contains(&plugin_id) {
                return Err(MangoError::DuplicateProvider(plugin_id));
            }
            table.discovered.insert(
                plugin_id.clone(),
                DiscoveredPlugin {
                    manifest: manifest.clone(),
                    dir: dir.to_path_buf(),
                },
            );
            table.failed.remove(dir);
            known
        };

        let lazy = Arc::new(LazyPluginProvider::new(manifest, Arc::downgrade(self)));
        if known {
            // Swap in place so lookups never miss the plugin
            self.registry.replace(lazy);
        } else {
            self.registry.register(lazy)?;
        }

        Ok(plugin_id)
    }

    async fn evict_idle(&self) {
        let mut table = self.table.write().await;
        let now = Instant::now();

        let idle: Vec<String> = table
            .loaded
            .iter()
            .filter(|(_, loaded)| {
                loaded.in_flight.load(Ordering::SeqCst) == 0
                    && now.duration_since(loaded.last_access.get()) >= self.unload_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        for plugin_id in idle {
            table.loaded.remove(&plugin_id);
            info!(plugin_id = %plugin_id, "Unloaded idle plugin (will reload on next access)");
        }
    }
}

/// Owner of all script plugins
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl PluginManager {
    /// Create a manager from the `[plugins]` configuration section
    pub fn new(config: &PluginsConfig, registry: Arc<ProviderRegistry>) -> Self {
        Self::with_settings(
            config.path.clone(),
            config.unload_timeout(),
            RuntimeLimits::from(config),
            registry,
        )
    }

    pub fn with_settings(
        plugin_dir: PathBuf,
        unload_timeout: Duration,
        limits: RuntimeLimits,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                plugin_dir,
                unload_timeout,
                limits,
                registry,
                table: RwLock::new(PluginTable::default()),
                load_gates: Mutex::new(HashMap::new()),
                evictor: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    pub fn unload_timeout(&self) -> Duration {
        self.inner.unload_timeout
    }

    /// Discover every plugin under the plugin root without loading any
    ///
    /// Failures are recorded per plugin and never abort discovery. Starts
    /// idle eviction on first use. Returns the number of plugins discovered.
    pub async fn load_plugins(&self) -> Result<usize> {
        let root = &self.inner.plugin_dir;
        info!(path = %root.display(), "Discovering plugins");

        tokio::fs::create_dir_all(root).await?;

        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            dirs.push(entry.path());
        }
        dirs.sort();

        let mut seen = HashSet::new();
        let mut discovered = 0;
        for dir in dirs {
            if !dir.join(MANIFEST_FILE).exists() {
                debug!(path = %dir.display(), "Skipping directory without {}", MANIFEST_FILE);
                continue;
            }

            match self.discover_in_scan(&dir, &mut seen).await {
                Ok(Some(plugin_id)) => {
                    debug!(plugin_id = %plugin_id, path = %dir.display(), "Discovered plugin");
                    discovered += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Failed to discover plugin");
                    self.inner.table.write().await.failed.insert(dir.clone(), e.to_string());
                }
            }
        }

        self.start_eviction();
        info!(count = discovered, "Discovered plugins (lazy loading enabled)");
        Ok(discovered)
    }

    async fn discover_in_scan(&self, dir: &Path, seen: &mut HashSet<String>) -> Result<Option<String>> {
        let manifest = load_manifest(dir)?;
        validate_api_version(&manifest.api_version)?;

        if !manifest.is_downloader() {
            info!(
                plugin_id = %manifest.id,
                plugin_type = %manifest.plugin_type,
                "Skipping plugin: type not supported yet"
            );
            return Ok(None);
        }

        if !seen.insert(manifest.id.clone()) {
            return Err(MangoError::DuplicateProvider(manifest.id));
        }

        self.inner.register_discovered(manifest, dir).await.map(Some)
    }

    /// Validate a plugin directory and register it for lazy loading
    pub async fn discover_plugin(&self, plugin_dir: &Path) -> Result<String> {
        let manifest = read_plugin(plugin_dir)?;
        let plugin_id = self.inner.register_discovered(manifest, plugin_dir).await?;
        info!(plugin_id = %plugin_id, "Discovered plugin, will load on first access");
        Ok(plugin_id)
    }

    /// Register a plugin and materialize its runtime right away
    ///
    /// # Errors
    /// `PluginAlreadyLoaded` if a runtime for the id exists; that instance is
    /// left untouched.
    pub async fn load_plugin(&self, plugin_dir: &Path) -> Result<String> {
        let manifest = read_plugin(plugin_dir)?;
        let plugin_id = manifest.id.clone();

        if self.is_loaded(&plugin_id).await {
            return Err(MangoError::PluginAlreadyLoaded(plugin_id));
        }

        let known = self.inner.table.read().await.discovered.contains_key(&plugin_id);
        self.inner.register_discovered(manifest, plugin_dir).await?;
        if let Err(e) = self.inner.load_plugin_if_needed(&plugin_id).await {
            let mut table = self.inner.table.write().await;
            if !known {
                table.discovered.remove(&plugin_id);
                self.inner.registry.unregister(&plugin_id);
            }
            table.failed.insert(plugin_dir.to_path_buf(), e.to_string());
            return Err(e);
        }
        Ok(plugin_id)
    }

    /// Materialize a discovered plugin if it is not running
    pub async fn load_plugin_if_needed(&self, plugin_id: &str) -> Result<Arc<PluginProvider>> {
        self.inner.load_plugin_if_needed(plugin_id).await
    }

    pub async fn is_loaded(&self, plugin_id: &str) -> bool {
        self.inner.table.read().await.loaded.contains_key(plugin_id)
    }

    /// Drop a plugin's runtime; its registry entry stays and reloads on access
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        let removed = self.inner.table.write().await.loaded.remove(plugin_id);
        match removed {
            Some(_) => {
                info!(plugin_id = %plugin_id, "Unloaded plugin (will reload on next access)");
                Ok(())
            }
            None => Err(MangoError::PluginNotLoaded(plugin_id.to_string())),
        }
    }

    /// Unload a plugin and re-read its directory
    ///
    /// The refreshed plugin is loaded again on next access.
    pub async fn reload_plugin(&self, plugin_id: &str) -> Result<()> {
        let dir = {
            let table = self.inner.table.read().await;
            table
                .loaded
                .get(plugin_id)
                .map(|loaded| loaded.dir.clone())
                .or_else(|| table.discovered.get(plugin_id).map(|d| d.dir.clone()))
                .ok_or_else(|| MangoError::PluginNotFound(plugin_id.to_string()))?
        };

        if self.unload_plugin(plugin_id).await.is_err() {
            debug!(plugin_id = %plugin_id, "Plugin was not loaded, skipping unload");
        }

        self.discover_plugin(&dir).await.map(|_| ())
    }

    /// Reload every loaded plugin; failures are logged and skipped
    pub async fn reload_all_plugins(&self) -> Result<()> {
        let ids: Vec<String> = self.inner.table.read().await.loaded.keys().cloned().collect();
        for plugin_id in ids {
            if let Err(e) = self.reload_plugin(&plugin_id).await {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to reload plugin");
            }
        }
        Ok(())
    }

    pub async fn get_plugin_info(&self, plugin_id: &str) -> Option<PluginInfo> {
        let table = self.inner.table.read().await;
        if let Some(loaded) = table.loaded.get(plugin_id) {
            return Some(PluginInfo::from_manifest(loaded.provider.manifest(), &loaded.dir, true));
        }
        table
            .discovered
            .get(plugin_id)
            .map(|d| PluginInfo::from_manifest(&d.manifest, &d.dir, false))
    }

    /// Loaded, discovered and failed plugins, sorted by id
    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        let table = self.inner.table.read().await;

        let mut plugins: Vec<PluginInfo> = table
            .loaded
            .values()
            .map(|loaded| PluginInfo::from_manifest(loaded.provider.manifest(), &loaded.dir, true))
            .collect();

        plugins.extend(
            table
                .discovered
                .iter()
                .filter(|(id, _)| !table.loaded.contains_key(*id))
                .map(|(_, d)| PluginInfo::from_manifest(&d.manifest, &d.dir, false)),
        );

        plugins.extend(table.failed.iter().map(|(path, error)| PluginInfo::failed(path, error)));

        plugins.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));
        plugins
    }

    /// Stop idle eviction, unload every runtime and remove all plugins from
    /// the registry
    pub async fn stop(&self) {
        if let Some(token) = self.evictor_slot().take() {
            token.cancel();
        }

        let mut table = self.inner.table.write().await;
        for plugin_id in table.discovered.keys() {
            self.inner.registry.unregister(plugin_id);
        }
        table.loaded.clear();
        table.discovered.clear();

        info!("Plugin manager stopped");
    }

    fn evictor_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        match self.inner.evictor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn start_eviction(&self) {
        let mut slot = self.evictor_slot();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let timeout = self.inner.unload_timeout;
        let interval = timeout.clamp(MIN_EVICTION_INTERVAL, MAX_EVICTION_INTERVAL);
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            info!(
                interval_ms = interval.as_millis() as u64,
                timeout_secs = timeout.as_secs(),
                "Idle plugin eviction started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.evict_idle().await;
                    }
                }
            }
            debug!("Idle plugin eviction stopped");
        });
    }
}

/// Manifest of a plugin directory the host can activate
fn read_plugin(plugin_dir: &Path) -> Result<PluginManifest> {
    let manifest = load_manifest(plugin_dir)?;
    validate_api_version(&manifest.api_version)?;
    if !manifest.is_downloader() {
        return Err(MangoError::PluginLoadError(format!(
            "{}: plugin type {} not supported yet",
            manifest.id, manifest.plugin_type
        )));
    }
    Ok(manifest)
}

#[async_trait]
impl PluginManagement for PluginManager {
    fn plugin_dir(&self) -> &Path {
        &self.inner.plugin_dir
    }

    async fn load_plugin(&self, plugin_dir: &Path) -> Result<String> {
        PluginManager::load_plugin(self, plugin_dir).await
    }

    async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        PluginManager::unload_plugin(self, plugin_id).await
    }

    async fn reload_plugin(&self, plugin_id: &str) -> Result<()> {
        PluginManager::reload_plugin(self, plugin_id).await
    }

    async fn get_plugin_info(&self, plugin_id: &str) -> Option<PluginInfo> {
        PluginManager::get_plugin_info(self, plugin_id).await
    }

    async fn list_plugins(&self) -> Vec<PluginInfo> {
        PluginManager::list_plugins(self).await
    }
}
