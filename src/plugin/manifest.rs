//! Plugin manifest (`plugin.json`) loading and validation

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{MangoError, Result};

/// File name of the manifest inside a plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

/// The only plugin type the host activates today
pub const DOWNLOADER_PLUGIN_TYPE: &str = "downloader";

pub const DEFAULT_ENTRY_POINT: &str = "index.js";

/// Declaration of a script plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    pub api_version: String,
    #[serde(default = "default_plugin_type")]
    pub plugin_type: String,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
    /// Option name → `{ "type": ..., "default": ... }` (or a bare value)
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<ManifestRepository>,
}

/// Where a plugin was published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRepository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

fn default_plugin_type() -> String {
    DOWNLOADER_PLUGIN_TYPE.to_string()
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

impl PluginManifest {
    /// Parse a manifest from JSON text and validate it
    pub fn from_json(data: &str) -> Result<Self> {
        // `null` values for optional fields behave like absent ones
        let mut raw: Value = serde_json::from_str(data)
            .map_err(|e| MangoError::ManifestError(format!("failed to parse {}: {}", MANIFEST_FILE, e)))?;
        if let Some(object) = raw.as_object_mut() {
            object.retain(|_, v| !v.is_null());
        }

        for field in ["id", "name", "version", "api_version"] {
            let present = raw
                .get(field)
                .and_then(Value::as_str)
                .map_or(false, |s| !s.trim().is_empty());
            if !present {
                return Err(MangoError::ManifestError(format!(
                    "{} missing required field: {}",
                    MANIFEST_FILE, field
                )));
            }
        }

        let mut manifest: PluginManifest = serde_json::from_value(raw)
            .map_err(|e| MangoError::ManifestError(format!("failed to parse {}: {}", MANIFEST_FILE, e)))?;

        if manifest.plugin_type.is_empty() {
            manifest.plugin_type = default_plugin_type();
        }
        if manifest.entry_point.is_empty() {
            manifest.entry_point = default_entry_point();
        }

        Ok(manifest)
    }

    /// Whether the host activates this kind of plugin
    pub fn is_downloader(&self) -> bool {
        self.plugin_type == DOWNLOADER_PLUGIN_TYPE
    }

    /// Resolve the config schema to the values scripts see under `mango.config`
    ///
    /// `{ "default": v }` entries resolve to `v` (`null` when no default is
    /// declared); anything else is passed through as-is.
    pub fn config_defaults(&self) -> serde_json::Map<String, Value> {
        self.config
            .iter()
            .map(|(key, spec)| {
                let value = match spec {
                    Value::Object(schema) => schema.get("default").cloned().unwrap_or(Value::Null),
                    other => other.clone(),
                };
                (key.clone(), value)
            })
            .collect()
    }
}

/// Read and validate `<plugin_dir>/plugin.json`
pub fn load_manifest(plugin_dir: &Path) -> Result<PluginManifest> {
    let path = plugin_dir.join(MANIFEST_FILE);
    let data = std::fs::read_to_string(&path).map_err(|e| {
        MangoError::ManifestError(format!("failed to read {}: {}", path.display(), e))
    })?;
    PluginManifest::from_json(&data)
}
