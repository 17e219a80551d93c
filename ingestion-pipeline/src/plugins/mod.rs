pub mod database_chunker;
pub mod database_plugin;
pub mod default_plugin;
pub mod file_plugin;

use std::sync::Arc;

use common::config::AppConfig;
use common::plugin::PluginRegistry;

pub use database_plugin::DatabaseBuildPlugin;
pub use default_plugin::DefaultBuildPlugin;
pub use file_plugin::FileBuildPlugin;

/// The registry with every built-in plugin registered.
pub fn default_plugin_registry(config: &AppConfig) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(DatabaseBuildPlugin));
    registry.register(Arc::new(FileBuildPlugin::new(config.file_chunk_size)));
    registry.register(Arc::new(DefaultBuildPlugin));
    registry
}
