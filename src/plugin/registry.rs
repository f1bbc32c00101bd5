//! Provider registry
//!
//! Process-wide id → provider mapping. Native providers and plugin-backed
//! (lazy) providers register here the same way; the registry never looks at
//! which kind it holds.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use super::types::{Provider, ProviderInfo};
use crate::core::error::{MangoError, Result};

/// Registry of available providers
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Provider>>> {
        match self.providers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Provider>>> {
        match self.providers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a provider under `provider.get_info().id`
    ///
    /// # Errors
    /// `DuplicateProvider` if the id is taken; the existing entry is kept.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let info = provider.get_info();
        let mut providers = self.write();

        if providers.contains_key(&info.id) {
            return Err(MangoError::DuplicateProvider(info.id));
        }

        info!(provider_id = %info.id, name = %info.name, "Registered provider");
        providers.insert(info.id, provider);
        Ok(())
    }

    /// Register a provider, swapping out any entry with the same id
    ///
    /// Lookups see either the old or the new provider, never neither.
    pub fn replace(&self, provider: Arc<dyn Provider>) -> Option<Arc<dyn Provider>> {
        let info = provider.get_info();
        let previous = self.write().insert(info.id.clone(), provider);
        match previous {
            Some(_) => debug!(provider_id = %info.id, name = %info.name, "Replaced provider"),
            None => info!(provider_id = %info.id, name = %info.name, "Registered provider"),
        }
        previous
    }

    /// Look up a provider by id
    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Snapshot of all registered providers, sorted by id
    pub fn get_all(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self.read().values().map(|p| p.get_info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Remove a provider; returns whether it was registered
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            debug!(provider_id = %id, "Unregistered provider");
        }
        removed
    }

    pub fn unregister_all(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
