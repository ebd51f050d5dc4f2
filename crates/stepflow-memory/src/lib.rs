pub mod memory;
pub mod sqlite;

pub use memory::InMemorySessionStorage;
pub use sqlite::SqliteSessionStorage;

use std::sync::Arc;

use stepflow_core::config::{StorageBackend, StorageConfig};
use stepflow_core::error::Result;
use stepflow_core::traits::SessionStorage;

/// Build the session storage described by a `[storage]` config section.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn SessionStorage>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemorySessionStorage::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteSessionStorage::open(&config.path())?)),
    }
}
