//! Session persistence for axon.
//!
//! Stores implement [`axon_core::SessionStore`]. The [`SessionRecorder`]
//! feeds a store from the bus so persistence stays off the dispatch path.

pub mod in_memory;
pub mod recorder;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use recorder::SessionRecorder;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use axon_config::{PersistenceBackend, PersistenceConfig};
use axon_core::error::StoreError;
use axon_core::persistence::SessionStore;
use std::sync::Arc;

/// Open the store selected by `config`. `None` means persistence is off.
pub async fn open_store(
    config: &PersistenceConfig,
) -> Result<Option<Arc<dyn SessionStore>>, StoreError> {
    match config.backend {
        PersistenceBackend::None => Ok(None),
        PersistenceBackend::Memory => Ok(Some(Arc::new(InMemoryStore::new()))),
        #[cfg(feature = "sqlite")]
        PersistenceBackend::Sqlite => {
            let path = config.database_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Storage(format!("Cannot create {}: {e}", parent.display()))
                })?;
            }
            let store = SqliteStore::new(&path.to_string_lossy()).await?;
            Ok(Some(Arc::new(store)))
        }
        #[cfg(not(feature = "sqlite"))]
        PersistenceBackend::Sqlite => Err(StoreError::Storage(
            "axon-persistence was built without the `sqlite` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn none_backend_disables_persistence() {
        let config = PersistenceConfig::default();
        assert!(open_store(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_backend_opens() {
        let config = PersistenceConfig {
            backend: PersistenceBackend::Memory,
            ..Default::default()
        };
        let store = open_store(&config).await.unwrap().unwrap();
        assert_eq!(store.name(), "memory");
    }
}
