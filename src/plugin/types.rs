//! Provider capability contract
//!
//! Every content source, native or script-backed, implements `Provider`.
//! The domain exchange types below are plain value objects; for script
//! plugins only the adapter builds them out of untyped script output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::Result;

/// Unique identifier of a provider / plugin
pub type ProviderId = String;

/// Identity of a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub name: String,
}

/// One series returned by a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub cover_url: String,
    pub identifier: String,
}

/// One chapter of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterResult {
    pub identifier: String,
    pub title: String,
    pub volume: String,
    pub chapter: String,
    pub pages: i64,
    pub language: String,
    pub group_id: String,
    pub published_at: DateTime<Utc>,
}

/// Capability contract shared by native and plugin-backed providers
///
/// Chapters are expected in ascending chronological/ordinal order.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Identity of this provider; never fails
    fn get_info(&self) -> ProviderInfo;

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;

    async fn get_chapters(&self, series_id: &str) -> Result<Vec<ChapterResult>>;

    async fn get_page_urls(&self, chapter_id: &str) -> Result<Vec<String>>;
}
