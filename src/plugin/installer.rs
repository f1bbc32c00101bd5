//! Plugin repository service
//!
//! Fetches repository manifests, installs plugins from them into the plugin
//! root and checks installed plugins for newer releases. Installation goes
//! through the manager handed in at construction, so a freshly installed
//! plugin is validated and loaded exactly like a discovered one.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::manager::PluginManagement;
use super::manifest::{PluginManifest, MANIFEST_FILE};
use super::version::{is_newer_version, validate_api_version};
use crate::core::error::{MangoError, Result};

/// Default timeout of repository requests
pub const REPOSITORY_TIMEOUT: Duration = Duration::from_secs(30);

/// `repository.json` published by a plugin repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryManifest {
    #[serde(default)]
    pub version: String,
    pub repository: RepositoryInfo,
    #[serde(default)]
    pub plugins: Vec<RepositoryPlugin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A plugin offered by a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryPlugin {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub api_version: String,
    #[serde(default)]
    pub plugin_type: String,
    /// Base URL the entry script is fetched from
    pub download_url: String,
    pub manifest_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capabilities: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// A newer release of an installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginUpdateInfo {
    pub plugin_id: String,
    pub name: String,
    pub installed_version: String,
    pub available_version: String,
    pub repository_url: String,
    pub repository_name: String,
    pub has_update: bool,
}

/// Installs plugins from repositories
pub struct PluginRepositoryService {
    manager: Arc<dyn PluginManagement>,
    client: reqwest::Client,
}

impl PluginRepositoryService {
    pub fn new(manager: Arc<dyn PluginManagement>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REPOSITORY_TIMEOUT)
            .user_agent(concat!("mango-plugins/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(manager, client))
    }

    pub fn with_client(manager: Arc<dyn PluginManagement>, client: reqwest::Client) -> Self {
        Self { manager, client }
    }

    /// Fetch and parse a repository manifest
    pub async fn fetch_repository(&self, url: &str) -> Result<RepositoryManifest> {
        debug!(url = %url, "Fetching plugin repository");
        let data = self
            .download(url)
            .await
            .map_err(|e| MangoError::RepositoryError(format!("failed to fetch repository: {}", e)))?;

        serde_json::from_slice(&data)
            .map_err(|e| MangoError::RepositoryError(format!("failed to parse repository JSON: {}", e)))
    }

    /// Plugins of a repository this host can run
    pub async fn available_plugins(&self, url: &str) -> Result<Vec<RepositoryPlugin>> {
        let manifest = self.fetch_repository(url).await?;
        Ok(manifest
            .plugins
            .into_iter()
            .filter(|plugin| validate_api_version(&plugin.api_version).is_ok())
            .collect())
    }

    /// Download a plugin into `<plugin root>/<id>` and load it
    ///
    /// An existing installation is replaced; if the new version fails to
    /// download or load, the previous files are restored.
    pub async fn install_plugin(&self, url: &str, plugin_id: &str) -> Result<String> {
        let repository = self.fetch_repository(url).await?;
        let plugin = repository
            .plugins
            .into_iter()
            .find(|p| p.id == plugin_id)
            .ok_or_else(|| MangoError::PluginNotFound(format!("{} not found in repository", plugin_id)))?;

        validate_api_version(&plugin.api_version)?;
        if !is_safe_dir_name(plugin_id) {
            return Err(MangoError::RepositoryError(format!("invalid plugin id: {}", plugin_id)));
        }

        let plugin_dir = self.manager.plugin_dir().join(plugin_id);
        info!(
            plugin_id = %plugin_id,
            version = %plugin.version,
            path = %plugin_dir.display(),
            "Installing plugin"
        );

        let previously_known = self.manager.get_plugin_info(plugin_id).await.is_some();
        if previously_known {
            // Ignored when the plugin was only discovered
            let _ = self.manager.unload_plugin(plugin_id).await;
        }

        let backup = InstallationBackup::new(&plugin_dir)?;
        match self.download_and_load(&plugin, &plugin_dir).await {
            Ok(loaded_id) => {
                backup.commit()?;
                info!(plugin_id = %loaded_id, "Plugin installed");
                Ok(loaded_id)
            }
            Err(e) => {
                error!(plugin_id = %plugin_id, error = %e, "Plugin installation failed, rolling back");
                let restored = backup.rollback()?;
                if restored && previously_known {
                    if let Err(e) = self.manager.reload_plugin(plugin_id).await {
                        warn!(plugin_id = %plugin_id, error = %e, "Failed to restore previous plugin");
                    }
                }
                Err(e)
            }
        }
    }

    async fn download_and_load(&self, plugin: &RepositoryPlugin, plugin_dir: &Path) -> Result<String> {
        tokio::fs::create_dir_all(plugin_dir).await?;

        let manifest_data = self
            .download(&plugin.manifest_url)
            .await
            .map_err(|e| MangoError::RepositoryError(format!("failed to download {}: {}", MANIFEST_FILE, e)))?;
        let text = String::from_utf8_lossy(&manifest_data);
        let manifest = PluginManifest::from_json(&text)?;
        if manifest.id != plugin.id {
            return Err(MangoError::ManifestError(format!(
                "manifest id {} does not match repository entry {}",
                manifest.id, plugin.id
            )));
        }
        let entry_path = Path::new(&manifest.entry_point);
        if entry_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(MangoError::ManifestError(format!(
                "entry point {} escapes the plugin directory",
                manifest.entry_point
            )));
        }
        tokio::fs::write(plugin_dir.join(MANIFEST_FILE), &manifest_data).await?;

        let entry_url = format!("{}/{}", plugin.download_url.trim_end_matches('/'), manifest.entry_point);
        let entry_data = self.download(&entry_url).await.map_err(|e| {
            MangoError::RepositoryError(format!("failed to download {}: {}", manifest.entry_point, e))
        })?;
        let target = plugin_dir.join(entry_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &entry_data).await?;

        self.manager.load_plugin(plugin_dir).await
    }

    /// Installed plugins with a strictly newer compatible release
    ///
    /// Unreachable repositories and unparsable versions are skipped.
    pub async fn check_for_updates(&self, urls: &[String]) -> Result<Vec<PluginUpdateInfo>> {
        let installed: HashMap<String, String> = self
            .manager
            .list_plugins()
            .await
            .into_iter()
            .filter(|p| p.error.is_none())
            .map(|p| (p.id, p.version))
            .collect();

        let mut updates = Vec::new();
        for url in urls {
            let repository = match self.fetch_repository(url).await {
                Ok(repository) => repository,
                Err(e) => {
                    warn!(url = %url, error = %e, "Skipping unreachable repository");
                    continue;
                }
            };

            for plugin in repository.plugins {
                let Some(installed_version) = installed.get(&plugin.id) else {
                    continue;
                };
                if validate_api_version(&plugin.api_version).is_err() {
                    continue;
                }

                match is_newer_version(installed_version, &plugin.version) {
                    Ok(true) => updates.push(PluginUpdateInfo {
                        plugin_id: plugin.id,
                        name: plugin.name,
                        installed_version: installed_version.clone(),
                        available_version: plugin.version,
                        repository_url: url.clone(),
                        repository_name: repository.repository.name.clone(),
                        has_update: true,
                    }),
                    Ok(false) => {}
                    Err(e) => {
                        debug!(plugin_id = %plugin.id, error = %e, "Skipping plugin with invalid version");
                    }
                }
            }
        }

        Ok(updates)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(MangoError::NetworkError(format!(
                "{} returned status {}",
                url,
                resp.status().as_u16()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Plugin ids become directory names under the plugin root
fn is_safe_dir_name(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(|c: char| c == '/' || c == '\\' || c.is_control())
}

/// Moves an existing installation aside until the new one is committed
struct InstallationBackup {
    target_path: PathBuf,
    backup_path: Option<PathBuf>,
    done: bool,
}

impl InstallationBackup {
    fn new(target_path: &Path) -> Result<Self> {
        let backup_path = if target_path.exists() {
            let mut name = target_path.file_name().unwrap_or_default().to_os_string();
            name.push(".backup");
            let backup = target_path.with_file_name(name);
            debug!("Creating backup: {} -> {}", target_path.display(), backup.display());
            if backup.exists() {
                fs::remove_dir_all(&backup)?;
            }
            fs::rename(target_path, &backup)?;
            Some(backup)
        } else {
            None
        };

        Ok(Self {
            target_path: target_path.to_path_buf(),
            backup_path,
            done: false,
        })
    }

    fn commit(mut self) -> Result<()> {
        self.done = true;
        if let Some(backup) = &self.backup_path {
            fs::remove_dir_all(backup)?;
        }
        Ok(())
    }

    /// Remove the partial installation; returns whether a backup was restored
    fn rollback(mut self) -> Result<bool> {
        self.done = true;
        self.restore()
    }

    fn restore(&self) -> Result<bool> {
        if self.target_path.exists() {
            fs::remove_dir_all(&self.target_path)?;
        }
        match &self.backup_path {
            Some(backup) => {
                debug!("Restoring backup: {} -> {}", backup.display(), self.target_path.display());
                fs::rename(backup, &self.target_path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for InstallationBackup {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.restore() {
                error!("Failed to roll back installation: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::js_runtime::RuntimeLimits;
    use crate::plugin::manager::PluginManager;
    use crate::plugin::registry::ProviderRegistry;
    use mockito::{Mock, Server, ServerGuard};
    use serde_json::json;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"
        exports.getInfo = () => ({ id: "remote", name: "Remote" });
        exports.search = (query) => [{ title: "Remote " + query, identifier: "r1" }];
        exports.getChapters = () => [];
        exports.getPageURLs = () => [];
    "#;

    fn plugin_manifest(version: &str) -> String {
        json!({ "id": "remote", "name": "Remote", "version": version, "api_version": "1.0" }).to_string()
    }

    fn repository(server: &ServerGuard, plugins: serde_json::Value) -> String {
        json!({
            "version": "1",
            "repository": { "name": "Test Repo", "url": server.url() },
            "plugins": plugins,
        })
        .to_string()
    }

    fn remote_entry(server: &ServerGuard, version: &str, api_version: &str) -> serde_json::Value {
        json!({
            "id": "remote",
            "name": "Remote",
            "version": version,
            "api_version": api_version,
            "plugin_type": "downloader",
            "download_url": format!("{}/remote/", server.url()),
            "manifest_url": format!("{}/remote/plugin.json", server.url()),
        })
    }

    async fn serve(server: &mut ServerGuard, path: &str, body: String) -> Mock {
        server
            .mock("GET", path)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await
    }

    fn service(root: &TempDir) -> (PluginManager, PluginRepositoryService) {
        let manager = PluginManager::with_settings(
            root.path().to_path_buf(),
            Duration::from_secs(1800),
            RuntimeLimits::default(),
            Arc::new(ProviderRegistry::new()),
        );
        let service = PluginRepositoryService::new(Arc::new(manager.clone())).unwrap();
        (manager, service)
    }

    #[tokio::test]
    async fn test_fetch_repository_and_filter_compatible() {
        let mut server = Server::new_async().await;
        let body = repository(
            &server,
            json!([remote_entry(&server, "1.0.0", "1.0"), {
                "id": "future", "name": "Future", "version": "1.0.0", "api_version": "2.0",
                "download_url": "x", "manifest_url": "y"
            }]),
        );
        serve(&mut server, "/repo.json", body).await;

        let root = TempDir::new().unwrap();
        let (_manager, service) = service(&root);
        let url = format!("{}/repo.json", server.url());

        let manifest = service.fetch_repository(&url).await.unwrap();
        assert_eq!(manifest.repository.name, "Test Repo");
        assert_eq!(manifest.plugins.len(), 2);

        let available = service.available_plugins(&url).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "remote");
    }

    #[tokio::test]
    async fn test_fetch_repository_errors() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/missing.json").with_status(404).create_async().await;
        serve(&mut server, "/garbage.json", "not json".to_string()).await;

        let root = TempDir::new().unwrap();
        let (_manager, service) = service(&root);

        let err = service
            .fetch_repository(&format!("{}/missing.json", server.url()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("status 404"), "{}", err);

        let err = service
            .fetch_repository(&format!("{}/garbage.json", server.url()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to parse repository JSON"), "{}", err);
    }

    #[tokio::test]
    async fn test_install_plugin() {
        let mut server = Server::new_async().await;
        let body = repository(&server, json!([remote_entry(&server, "1.0.0", "1.0")]));
        serve(&mut server, "/repo.json", body).await;
        serve(&mut server, "/remote/plugin.json", plugin_manifest("1.0.0")).await;
        serve(&mut server, "/remote/index.js", SCRIPT.to_string()).await;

        let root = TempDir::new().unwrap();
        let (manager, service) = service(&root);

        let id = service
            .install_plugin(&format!("{}/repo.json", server.url()), "remote")
            .await
            .unwrap();
        assert_eq!(id, "remote");
        assert!(root.path().join("remote").join("plugin.json").exists());
        assert!(root.path().join("remote").join("index.js").exists());
        assert!(manager.is_loaded("remote").await);

        let provider = manager.registry().get("remote").unwrap();
        assert_eq!(provider.search("x").await.unwrap()[0].title, "Remote x");
    }

    #[tokio::test]
    async fn test_install_rejects_unknown_and_incompatible() {
        let mut server = Server::new_async().await;
        let body = repository(&server, json!([remote_entry(&server, "1.0.0", "9.9")]));
        serve(&mut server, "/repo.json", body).await;

        let root = TempDir::new().unwrap();
        let (_manager, service) = service(&root);
        let url = format!("{}/repo.json", server.url());

        let err = service.install_plugin(&url, "nope").await.unwrap_err();
        assert!(matches!(err, MangoError::PluginNotFound(_)));

        let err = service.install_plugin(&url, "remote").await.unwrap_err();
        assert!(matches!(err, MangoError::IncompatibleApiVersion(_)));
        assert!(!root.path().join("remote").exists());
    }

    #[tokio::test]
    async fn test_failed_install_is_cleaned_up() {
        let mut server = Server::new_async().await;
        let body = repository(&server, json!([remote_entry(&server, "1.0.0", "1.0")]));
        serve(&mut server, "/repo.json", body).await;
        serve(&mut server, "/remote/plugin.json", plugin_manifest("1.0.0")).await;
        serve(&mut server, "/remote/index.js", "exports.getInfo = () => ({});".to_string()).await;

        let root = TempDir::new().unwrap();
        let (manager, service) = service(&root);

        let err = service
            .install_plugin(&format!("{}/repo.json", server.url()), "remote")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("plugin missing required export"), "{}", err);
        assert!(!root.path().join("remote").exists());
        assert!(!manager.is_loaded("remote").await);
    }

    #[tokio::test]
    async fn test_failed_update_restores_previous_version() {
        let mut server = Server::new_async().await;
        let body = repository(&server, json!([remote_entry(&server, "2.0.0", "1.0")]));
        serve(&mut server, "/repo.json", body).await;
        serve(&mut server, "/remote/plugin.json", plugin_manifest("2.0.0")).await;
        server.mock("GET", "/remote/index.js").with_status(500).create_async().await;

        let root = TempDir::new().unwrap();
        let installed = root.path().join("remote");
        fs::create_dir_all(&installed).unwrap();
        fs::write(installed.join("plugin.json"), plugin_manifest("1.0.0")).unwrap();
        fs::write(installed.join("index.js"), SCRIPT).unwrap();

        let (manager, service) = service(&root);
        manager.load_plugins().await.unwrap();

        let err = service
            .install_plugin(&format!("{}/repo.json", server.url()), "remote")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to download index.js"), "{}", err);

        let info = manager.get_plugin_info("remote").await.unwrap();
        assert_eq!(info.version, "1.0.0");
        let provider = manager.registry().get("remote").unwrap();
        assert_eq!(provider.search("y").await.unwrap()[0].title, "Remote y");
        assert!(!root.path().join("remote.backup").exists());
    }

    #[tokio::test]
    async fn test_check_for_updates() {
        let mut server = Server::new_async().await;
        let body = repository(
            &server,
            json!([
                remote_entry(&server, "1.2.0", "1.0"),
                {
                    "id": "same", "name": "Same", "version": "1.0.0", "api_version": "1.0",
                    "download_url": "x", "manifest_url": "y"
                },
                {
                    "id": "weird", "name": "Weird", "version": "latest", "api_version": "1.0",
                    "download_url": "x", "manifest_url": "y"
                },
                {
                    "id": "uninstalled", "name": "Other", "version": "5.0.0", "api_version": "1.0",
                    "download_url": "x", "manifest_url": "y"
                }
            ]),
        );
        serve(&mut server, "/repo.json", body).await;

        let root = TempDir::new().unwrap();
        for (id, version) in [("remote", "1.0.0"), ("same", "1.0.0"), ("weird", "1.0.0")] {
            let dir = root.path().join(id);
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("plugin.json"),
                json!({ "id": id, "name": id, "version": version, "api_version": "1.0" }).to_string(),
            )
            .unwrap();
            fs::write(dir.join("index.js"), SCRIPT).unwrap();
        }

        let (manager, service) = service(&root);
        manager.load_plugins().await.unwrap();

        let urls = vec![
            format!("{}/repo.json", server.url()),
            "http://127.0.0.1:1/unreachable.json".to_string(),
        ];
        let updates = service.check_for_updates(&urls).await.unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].plugin_id, "remote");
        assert_eq!(updates[0].installed_version, "1.0.0");
        assert_eq!(updates[0].available_version, "1.2.0");
        assert_eq!(updates[0].repository_name, "Test Repo");
        assert!(updates[0].has_update);
    }

    #[test]
    fn test_installation_backup_rollback_and_commit() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("plugin");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("index.js"), "old").unwrap();

        let backup = InstallationBackup::new(&target).unwrap();
        assert!(!target.exists());
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("index.js"), "new").unwrap();
        assert!(backup.rollback().unwrap());
        assert_eq!(fs::read_to_string(target.join("index.js")).unwrap(), "old");

        let backup = InstallationBackup::new(&target).unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("index.js"), "new").unwrap();
        backup.commit().unwrap();
        assert_eq!(fs::read_to_string(target.join("index.js")).unwrap(), "new");
        assert!(!root.path().join("plugin.backup").exists());
    }

    #[test]
    fn test_plugin_id_must_be_a_plain_directory_name() {
        assert!(is_safe_dir_name("mangadex"));
        assert!(is_safe_dir_name("com.example.reader"));
        assert!(!is_safe_dir_name(""));
        assert!(!is_safe_dir_name("../escape"));
        assert!(!is_safe_dir_name(".hidden"));
        assert!(!is_safe_dir_name("a\\b"));
    }

    #[test]
    fn test_installation_backup_restores_on_drop() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("plugin");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("index.js"), "old").unwrap();

        {
            let _backup = InstallationBackup::new(&target).unwrap();
            fs::create_dir_all(&target).unwrap();
        }
        assert_eq!(fs::read_to_string(target.join("index.js")).unwrap(), "old");
    }
}
