pub mod connection;
pub mod migrations;
pub mod stores;

use std::sync::Arc;

use loanflow_core::config::{AppConfig, StorageBackend};
use loanflow_core::context::{ContextStore, InMemoryContextStore, StoreError};
use sqlx::migrate::MigrateError;
use thiserror::Error;
use tracing::info;

pub use connection::{connect, connect_with_settings, DbPool};
pub use stores::{FileContextStore, SqlContextStore};

#[derive(Debug, Error)]
pub enum StoreOpenError {
    #[error("database connection failed: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[from] MigrateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builds the context store selected by `storage.backend`, migrating SQLite first.
pub async fn open_context_store(
    config: &AppConfig,
) -> Result<Arc<dyn ContextStore>, StoreOpenError> {
    let store: Arc<dyn ContextStore> = match config.storage.backend {
        StorageBackend::Sqlite => {
            let pool = connect(&config.database).await?;
            migrations::run_pending(&pool).await?;
            Arc::new(SqlContextStore::new(pool))
        }
        StorageBackend::File => {
            Arc::new(FileContextStore::open(config.storage.context_dir.clone()).await?)
        }
        StorageBackend::Memory => Arc::new(InMemoryContextStore::new()),
    };

    info!(
        event_name = "storage.context.opened",
        correlation_id = "bootstrap",
        backend = store.backend(),
        "context store ready"
    );
    Ok(store)
}
