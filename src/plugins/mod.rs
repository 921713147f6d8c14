//! Bundled plugins.
//!
//! Each plugin is self-contained: it declares its commands and data types in
//! a [`PluginManifest`](crate::engine::PluginManifest) and handles them on its
//! own. Nothing here is known to the engine until [`register_builtin`] hands
//! it over.

pub mod hash_table;
pub mod json;
pub mod replication;
pub mod string;
pub mod system;

use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::{Engine, RegistryError};

pub use hash_table::HashTablePlugin;
pub use json::JsonPlugin;
pub use replication::ReplicationPlugin;
pub use string::StringPlugin;
pub use system::SystemPlugin;

/// Registers every bundled plugin. `dump_path` is where `SAVE` writes.
pub fn register_builtin(
    engine: &mut Engine,
    dump_path: impl Into<PathBuf>,
) -> Result<(), RegistryError> {
    engine.register_plugin(Arc::new(SystemPlugin::new(dump_path)))?;
    engine.register_plugin(Arc::new(ReplicationPlugin))?;
    engine.register_plugin(Arc::new(HashTablePlugin))?;
    engine.register_plugin(Arc::new(StringPlugin))?;
    engine.register_plugin(Arc::new(JsonPlugin))?;

    Ok(())
}
