//! Per-plugin persistent key/value state
//!
//! Scripts mutate the store through `mango.state`; writes only mark it dirty.
//! A `StateFlusher` task persists dirty state to `<plugin dir>/state.json`
//! on a fixed interval and stops (after a last flush) when it is dropped
//! together with the owning runtime.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State file name inside the plugin directory
pub const STATE_FILE: &str = "state.json";

/// Default flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

pub struct StateStore {
    path: PathBuf,
    data: RwLock<Map<String, Value>>,
    dirty: AtomicBool,
}

impl StateStore {
    /// Open the store for a plugin directory, loading previously flushed state
    ///
    /// A missing file starts empty; an unreadable or corrupt file is logged
    /// and also starts empty.
    pub fn open(plugin_dir: &Path) -> Self {
        let path = plugin_dir.join(STATE_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt plugin state file");
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read plugin state file");
                Map::new()
            }
        };

        Self {
            path,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Map<String, Value>> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Map<String, Value>> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.write().insert(key.to_string(), value);
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn get_all(&self) -> Map<String, Value> {
        self.read().clone()
    }

    pub fn clear(&self) {
        self.write().clear();
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Persist the state if it changed since the last flush
    ///
    /// The file is replaced atomically and is readable by the owner only.
    pub fn flush(&self) -> std::io::Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.write_file();
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    fn write_file(&self) -> std::io::Result<()> {
        let snapshot = serde_json::to_vec_pretty(&*self.read())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            file.write_all(&snapshot)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
    }
}

/// Periodic flush task bound to a runtime's lifetime
///
/// Dropping the flusher stops the task and writes any pending changes.
pub struct StateFlusher {
    store: Arc<StateStore>,
    plugin_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StateFlusher {
    /// Start flushing `store` every `interval` on the current Tokio runtime
    pub fn spawn(store: Arc<StateStore>, plugin_id: &str, interval: Duration) -> Result<Self, TryCurrentError> {
        let runtime = Handle::try_current()?;
        let cancel = CancellationToken::new();

        let handle = runtime.spawn({
            let store = store.clone();
            let plugin_id = plugin_id.to_string();
            let cancel = cancel.clone();
            async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = store.flush() {
                                warn!(plugin_id = %plugin_id, error = %e, "Failed to flush plugin state");
                            }
                        }
                    }
                }
                debug!(plugin_id = %plugin_id, "State flusher stopped");
            }
        });

        Ok(Self {
            store,
            plugin_id: plugin_id.to_string(),
            cancel,
            handle,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for StateFlusher {
    fn drop(&mut self) {
        self.cancel.cancel();
        // The owning runtime may be shutting down and never poll the task again
        if let Err(e) = self.store.flush() {
            warn!(plugin_id = %self.plugin_id, error = %e, "Failed to flush plugin state on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn read_state_file(dir: &TempDir) -> Map<String, Value> {
        let text = std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_set_marks_dirty_and_flush_persists() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path());
        assert!(!store.is_dirty());

        store.set("lastChapter", json!(42));
        assert!(store.is_dirty());
        assert!(!dir.path().join(STATE_FILE).exists());

        store.flush().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(read_state_file(&dir)["lastChapter"], json!(42));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = StateStore::open(dir.path());
            store.set("cursor", json!({ "page": 3 }));
            store.flush().unwrap();
        }

        let store = StateStore::open(dir.path());
        assert_eq!(store.get("cursor"), Some(json!({ "page": 3 })));
        assert_eq!(store.get_all().len(), 1);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path());
        store.set("a", json!(1));
        store.flush().unwrap();

        store.clear();
        assert!(store.is_dirty());
        store.flush().unwrap();
        assert!(read_state_file(&dir).is_empty());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{ nope").unwrap();

        let store = StateStore::open(dir.path());
        assert!(store.get_all().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path());
        store.set("k", json!("v"));
        store.flush().unwrap();

        let mode = std::fs::metadata(dir.path().join(STATE_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_flusher_writes_on_interval() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path()));
        let flusher = StateFlusher::spawn(store.clone(), "test", Duration::from_millis(20)).unwrap();
        assert!(flusher.is_running());

        store.set("seen", json!(true));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!store.is_dirty());
        assert_eq!(read_state_file(&dir)["seen"], json!(true));
        drop(flusher);
    }

    #[tokio::test]
    async fn test_flusher_stops_and_flushes_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path()));
        let flusher = StateFlusher::spawn(store.clone(), "test", Duration::from_secs(3600)).unwrap();

        store.set("pending", json!("write"));
        drop(flusher);
        assert_eq!(read_state_file(&dir)["pending"], json!("write"));

        // The task releases its handle on the store once it sees the cancel
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[test]
    fn test_flusher_requires_a_runtime() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path()));
        assert!(StateFlusher::spawn(store, "test", Duration::from_millis(20)).is_err());
    }
}
