//! Registry placeholder for discovered plugins
//!
//! A `LazyPluginProvider` is what the registry holds for every script plugin.
//! Identity comes straight from the manifest; capability calls ask the
//! manager for a running instance first, which materializes the runtime on
//! demand and keeps it alive while the call is in flight.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::adapter::{manifest_info, PluginProvider};
use super::manager::{CallGuard, ManagerInner};
use super::manifest::PluginManifest;
use super::types::{ChapterResult, Provider, ProviderInfo, SearchResult};
use crate::core::error::{MangoError, Result};

pub struct LazyPluginProvider {
    manifest: PluginManifest,
    manager: Weak<ManagerInner>,
}

impl LazyPluginProvider {
    pub(crate) fn new(manifest: PluginManifest, manager: Weak<ManagerInner>) -> Self {
        Self { manifest, manager }
    }

    pub fn plugin_id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn ensure_loaded(&self) -> Result<(Arc<PluginProvider>, CallGuard)> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| MangoError::PluginNotFound(self.manifest.id.clone()))?;
        manager.acquire(&self.manifest.id).await
    }
}

#[async_trait]
impl Provider for LazyPluginProvider {
    /// Answered from the manifest; never starts the runtime
    fn get_info(&self) -> ProviderInfo {
        manifest_info(&self.manifest)
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let (provider, _call) = self.ensure_loaded().await?;
        provider.search(query).await
    }

    async fn get_chapters(&self, series_id: &str) -> Result<Vec<ChapterResult>> {
        let (provider, _call) = self.ensure_loaded().await?;
        provider.get_chapters(series_id).await
    }

    async fn get_page_urls(&self, chapter_id: &str) -> Result<Vec<String>> {
        let (provider, _call) = self.ensure_loaded().await?;
        provider.get_page_urls(chapter_id).await
    }
}
