//! Mango plugin host
//!
//! Command-line front end over the provider registry and plugin manager.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mango_plugins::core::config::{CliArgs, Command, Config};
use mango_plugins::core::Logger;
use mango_plugins::plugin::{
    MockadexProvider, PluginManager, PluginRepositoryService, Provider, ProviderRegistry,
};
use serde::Serialize;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let config = match Config::load(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting mango-plugins v{}", mango_plugins::VERSION);
    info!(
        plugin_dir = ?config.plugins.path,
        unload_timeout_secs = config.plugins.unload_timeout_secs,
        "Plugin configuration"
    );

    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(MockadexProvider::new()))?;

    let manager = PluginManager::new(&config.plugins, registry.clone());
    let discovered = manager.load_plugins().await?;
    info!(discovered, "Plugins discovered");

    let result = run(&cli.command, &config, &manager, &registry).await;
    manager.stop().await;
    result
}

async fn run(
    command: &Command,
    config: &Config,
    manager: &PluginManager,
    registry: &Arc<ProviderRegistry>,
) -> Result<()> {
    match command {
        Command::List => {
            #[derive(Serialize)]
            struct Listing {
                providers: Vec<mango_plugins::plugin::ProviderInfo>,
                plugins: Vec<mango_plugins::plugin::PluginInfo>,
            }
            print_json(&Listing {
                providers: registry.get_all(),
                plugins: manager.list_plugins().await,
            })
        }
        Command::Search { provider, query } => {
            let results = provider_for(registry, provider)?.search(query).await?;
            print_json(&results)
        }
        Command::Chapters { provider, series } => {
            let chapters = provider_for(registry, provider)?.get_chapters(series).await?;
            print_json(&chapters)
        }
        Command::Pages { provider, chapter } => {
            let pages = provider_for(registry, provider)?.get_page_urls(chapter).await?;
            print_json(&pages)
        }
        Command::Reload { id } => {
            match id {
                Some(id) => manager.reload_plugin(id).await?,
                None => manager.reload_all_plugins().await?,
            }
            print_json(&manager.list_plugins().await)
        }
        Command::RepoList { url } => {
            let service = PluginRepositoryService::new(Arc::new(manager.clone()))?;
            print_json(&service.available_plugins(url).await?)
        }
        Command::Install { url, plugin_id } => {
            let service = PluginRepositoryService::new(Arc::new(manager.clone()))?;
            let id = service.install_plugin(url, plugin_id).await?;
            print_json(&manager.get_plugin_info(&id).await)
        }
        Command::Updates => {
            let service = PluginRepositoryService::new(Arc::new(manager.clone()))?;
            print_json(&service.check_for_updates(&config.plugins.repositories).await?)
        }
    }
}

fn provider_for(registry: &ProviderRegistry, id: &str) -> Result<Arc<dyn Provider>> {
    registry
        .get(id)
        .with_context(|| format!("Provider with ID '{}' not found", id))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
