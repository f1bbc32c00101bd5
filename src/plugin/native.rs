//! Native built-in providers
//!
//! `MockadexProvider` serves deterministic fake data. It is registered at
//! startup next to the script plugins and is handy for exercising the
//! download pipeline without network access.

use chrono::{Duration, Utc};

use super::types::{ChapterResult, Provider, ProviderInfo, SearchResult};
use crate::core::error::Result;

pub const MOCKADEX_ID: &str = "mockadex";

const SEARCH_RESULTS: usize = 10;
const CHAPTERS_PER_SERIES: i64 = 25;
const PAGES_PER_CHAPTER: usize = 20;

#[derive(Debug, Default, Clone)]
pub struct MockadexProvider;

impl MockadexProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Provider for MockadexProvider {
    fn get_info(&self) -> ProviderInfo {
        ProviderInfo {
            id: MOCKADEX_ID.to_string(),
            name: "Mockadex".to_string(),
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        Ok((1..=SEARCH_RESULTS)
            .map(|i| SearchResult {
                title: format!("{} - Result {}", query, i),
                cover_url: format!("https://placehold.co/400x600/2a2a2a/f0f0f0?text=Cover+{}", i),
                identifier: format!("mock-series-{}", i),
            })
            .collect())
    }

    async fn get_chapters(&self, series_id: &str) -> Result<Vec<ChapterResult>> {
        let now = Utc::now();
        Ok((1..=CHAPTERS_PER_SERIES)
            .map(|i| ChapterResult {
                identifier: format!("mock-chapter-{}-{}", series_id, i),
                title: format!("Chapter {}: The Mocking", i),
                volume: "1".to_string(),
                chapter: i.to_string(),
                pages: 20 + i,
                language: "en".to_string(),
                group_id: "mock-group".to_string(),
                published_at: now - Duration::days(CHAPTERS_PER_SERIES - i),
            })
            .collect())
    }

    async fn get_page_urls(&self, _chapter_id: &str) -> Result<Vec<String>> {
        Ok((1..=PAGES_PER_CHAPTER)
            .map(|i| format!("https://placehold.co/800x1200?text=Page+{}", i))
            .collect())
    }
}
