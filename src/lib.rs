//! Mango plugin host library
//!
//! Runs manga downloader providers: built-in native providers and sandboxed
//! JavaScript plugins discovered from a plugin directory, all served through
//! one provider registry.

pub mod core;
pub mod plugin;

pub use crate::core::{Config, MangoError, PluginError};
pub use plugin::{PluginManager, Provider, ProviderRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
