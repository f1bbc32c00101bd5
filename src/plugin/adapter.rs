//! Provider adapter for script plugins
//!
//! Exposes a running plugin as a `Provider`, converting the untyped values
//! its exports return into the typed domain results. Conversion is lenient:
//! missing results mean "nothing found", malformed elements are skipped.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::js_wrapper::JsPluginRuntime;
use super::manifest::PluginManifest;
use super::types::{ChapterResult, Provider, ProviderInfo, SearchResult};
use crate::core::error::{PluginError, Result};

/// A loaded script plugin behind the `Provider` contract
pub struct PluginProvider {
    manifest: PluginManifest,
    runtime: JsPluginRuntime,
}

impl PluginProvider {
    pub fn new(manifest: PluginManifest, runtime: JsPluginRuntime) -> Self {
        Self { manifest, runtime }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn runtime(&self) -> &JsPluginRuntime {
        &self.runtime
    }

    async fn call(&self, function: &str, args: Vec<Value>) -> std::result::Result<Value, PluginError> {
        self.runtime
            .call(function, args)
            .await
            .map_err(|e| PluginError::wrap(e, function))
    }

    /// Elements of an array result; `null` and non-arrays yield nothing
    fn items(&self, function: &str, value: Value) -> Vec<Value> {
        match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                warn!(
                    plugin_id = %self.manifest.id,
                    function = %function,
                    kind = json_kind(&other),
                    "Plugin returned a non-array result, treating as empty"
                );
                Vec::new()
            }
        }
    }

    fn objects(&self, function: &str, value: Value) -> Vec<Map<String, Value>> {
        self.items(function, value)
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item {
                Value::Object(object) => Some(object),
                other => {
                    warn!(
                        plugin_id = %self.manifest.id,
                        function = %function,
                        index,
                        kind = json_kind(&other),
                        "Skipping malformed result element"
                    );
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Provider for PluginProvider {
    fn get_info(&self) -> ProviderInfo {
        manifest_info(&self.manifest)
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let value = self.call("search", vec![Value::from(query)]).await?;
        Ok(self
            .objects("search", value)
            .iter()
            .map(search_result_from)
            .collect())
    }

    async fn get_chapters(&self, series_id: &str) -> Result<Vec<ChapterResult>> {
        let value = self.call("getChapters", vec![Value::from(series_id)]).await?;
        Ok(self
            .objects("getChapters", value)
            .iter()
            .map(chapter_result_from)
            .collect())
    }

    async fn get_page_urls(&self, chapter_id: &str) -> Result<Vec<String>> {
        let value = self.call("getPageURLs", vec![Value::from(chapter_id)]).await?;
        Ok(self
            .items("getPageURLs", value)
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item {
                Value::String(url) => Some(url),
                Value::Null => {
                    debug!(plugin_id = %self.manifest.id, index, "Skipping null page URL");
                    None
                }
                other => {
                    warn!(
                        plugin_id = %self.manifest.id,
                        index,
                        kind = json_kind(&other),
                        "Converting non-string page URL to text"
                    );
                    Some(other.to_string())
                }
            })
            .collect())
    }
}

/// Identity reported for a plugin; the name falls back to the id
pub fn manifest_info(manifest: &PluginManifest) -> ProviderInfo {
    let name = if manifest.name.is_empty() {
        manifest.id.clone()
    } else {
        manifest.name.clone()
    };
    ProviderInfo {
        id: manifest.id.clone(),
        name,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// First present key wins; numbers are rendered as text
fn string_field(object: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| match object.get(*key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Integer or floating point (truncated); numeric strings are accepted too
fn int_field(object: &Map<String, Value>, keys: &[&str]) -> i64 {
    keys.iter()
        .find_map(|key| match object.get(*key) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(|f| f as i64),
            _ => None,
        })
        .unwrap_or_default()
}

/// RFC 3339 or `YYYY-MM-DDTHH:MM:SS` (UTC); anything else is the epoch
pub fn parse_published_at(text: &str) -> DateTime<Utc> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return parsed.and_utc();
    }
    DateTime::<Utc>::default()
}

fn search_result_from(object: &Map<String, Value>) -> SearchResult {
    SearchResult {
        title: string_field(object, &["title"]),
        cover_url: string_field(object, &["cover_url", "coverURL", "coverUrl"]),
        identifier: string_field(object, &["identifier", "id"]),
    }
}

fn chapter_result_from(object: &Map<String, Value>) -> ChapterResult {
    ChapterResult {
        identifier: string_field(object, &["identifier", "id"]),
        title: string_field(object, &["title"]),
        volume: string_field(object, &["volume"]),
        chapter: string_field(object, &["chapter"]),
        pages: int_field(object, &["pages"]),
        language: string_field(object, &["language"]),
        group_id: string_field(object, &["group_id", "groupId", "groupID"]),
        published_at: parse_published_at(&string_field(object, &["published_at", "publishedAt"])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::js_runtime::RuntimeLimits;
    use crate::plugin::manifest::load_manifest;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    async fn provider(script: &str) -> (TempDir, PluginProvider) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("plugin.json"),
            json!({ "id": "shape", "name": "Shape Test", "version": "1.0.0", "api_version": "1.0" }).to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("index.js"), script).unwrap();

        let manifest = load_manifest(dir.path()).unwrap();
        let runtime = JsPluginRuntime::start(dir.path(), &manifest, RuntimeLimits::default())
            .await
            .unwrap();
        (dir, PluginProvider::new(manifest, runtime))
    }

    #[test]
    fn test_parse_published_at() {
        assert_eq!(
            parse_published_at("2024-03-01T10:20:30Z"),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap()
        );
        assert_eq!(
            parse_published_at("2024-03-01T12:20:30+02:00"),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap()
        );
        assert_eq!(
            parse_published_at("2024-03-01T10:20:30"),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap()
        );
        assert_eq!(parse_published_at("last tuesday"), DateTime::<Utc>::default());
        assert_eq!(parse_published_at(""), DateTime::<Utc>::default());
    }

    #[test]
    fn test_numeric_fields() {
        let object = json!({ "pages": 21.0, "chapter": 12.5, "volume": 3 });
        let object = object.as_object().unwrap();
        assert_eq!(int_field(object, &["pages"]), 21);
        assert_eq!(string_field(object, &["chapter"]), "12.5");
        assert_eq!(string_field(object, &["volume"]), "3");

        let object = json!({ "pages": "18" });
        assert_eq!(int_field(object.as_object().unwrap(), &["pages"]), 18);
    }

    #[test]
    fn test_chapter_field_aliases() {
        let object = json!({
            "id": "c1",
            "title": "Start",
            "groupId": "g1",
            "publishedAt": "2023-01-02T03:04:05Z",
            "pages": 10
        });
        let chapter = chapter_result_from(object.as_object().unwrap());
        assert_eq!(chapter.identifier, "c1");
        assert_eq!(chapter.group_id, "g1");
        assert_eq!(chapter.pages, 10);
        assert_eq!(chapter.published_at, Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(chapter.language, "");
    }

    #[test]
    fn test_manifest_info_falls_back_to_id() {
        let manifest = PluginManifest::from_json(
            &json!({ "id": "x", "name": " ", "version": "1.0.0", "api_version": "1.0" }).to_string(),
        );
        // Blank names are rejected at load time
        assert!(manifest.is_err());

        let mut manifest = PluginManifest::from_json(
            &json!({ "id": "x", "name": "X", "version": "1.0.0", "api_version": "1.0" }).to_string(),
        )
        .unwrap();
        assert_eq!(manifest_info(&manifest).name, "X");
        manifest.name.clear();
        assert_eq!(manifest_info(&manifest).name, "x");
    }

    #[tokio::test]
    async fn test_search_converts_results() {
        let (_dir, provider) = provider(
            r#"
            exports.getInfo = () => ({ id: "shape", name: "Shape Test" });
            exports.search = (query) => [
              { title: "Test Series", identifier: "1", cover_url: "https://example.com/c.jpg" },
              "not an object",
              { title: query, identifier: "2" },
            ];
            exports.getChapters = () => null;
            exports.getPageURLs = () => ["https://example.com/1.jpg", 42, "https://example.com/2.jpg"];
            "#,
        )
        .await;

        let results = provider.search("berserk").await.unwrap();
        assert_eq!(
            results,
            vec![
                SearchResult {
                    title: "Test Series".to_string(),
                    cover_url: "https://example.com/c.jpg".to_string(),
                    identifier: "1".to_string(),
                },
                SearchResult {
                    title: "berserk".to_string(),
                    cover_url: String::new(),
                    identifier: "2".to_string(),
                },
            ]
        );

        assert!(provider.get_chapters("1").await.unwrap().is_empty());
        assert_eq!(
            provider.get_page_urls("c1").await.unwrap(),
            vec!["https://example.com/1.jpg", "42", "https://example.com/2.jpg"]
        );
        assert_eq!(provider.get_info().name, "Shape Test");
    }

    #[tokio::test]
    async fn test_page_urls_are_coerced_to_text() {
        let (_dir, provider) = provider(
            r#"
            exports.getInfo = () => ({});
            exports.search = () => [];
            exports.getChapters = () => [];
            exports.getPageURLs = () => ["a.jpg", null, 7, 2.5, true, "b.jpg"];
            "#,
        )
        .await;

        assert_eq!(
            provider.get_page_urls("c1").await.unwrap(),
            vec!["a.jpg", "7", "2.5", "true", "b.jpg"]
        );
    }

    #[tokio::test]
    async fn test_async_chapters() {
        let (_dir, provider) = provider(
            r#"
            exports.getInfo = () => ({});
            exports.search = () => undefined;
            exports.getChapters = async (seriesId, mango) => {
              await mango.utils.sleep(1);
              return [
                { identifier: seriesId + "-1", title: "One", chapter: 1, volume: "1", pages: 20.0,
                  language: "en", group_id: "g", published_at: "2024-01-01T00:00:00Z" },
              ];
            };
            exports.getPageURLs = () => "not a list";
            "#,
        )
        .await;

        assert!(provider.search("x").await.unwrap().is_empty());

        let chapters = provider.get_chapters("s9").await.unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].identifier, "s9-1");
        assert_eq!(chapters[0].chapter, "1");
        assert_eq!(chapters[0].pages, 20);
        assert_eq!(chapters[0].published_at, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        assert!(provider.get_page_urls("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_errors_are_wrapped() {
        let (_dir, provider) = provider(
            r#"
            exports.getInfo = () => ({});
            exports.search = () => { throw new Error("site is down"); };
            exports.getChapters = () => [];
            exports.getPageURLs = () => [];
            "#,
        )
        .await;

        let err = provider.search("x").await.unwrap_err();
        let plugin_err = err.as_plugin_error().expect("plugin error");
        assert_eq!(plugin_err.function, "search");
        assert!(plugin_err.message.starts_with("search failed: execution error:"), "{}", plugin_err.message);
        assert!(plugin_err.cause.is_some());
        assert!(!plugin_err.is_timeout);
    }
}
