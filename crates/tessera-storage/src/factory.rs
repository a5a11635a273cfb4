use crate::{ChunkStore, LocalChunkStore, LocalStorage, Storage, StorageResult};
use std::sync::Arc;
use tessera_core::Config;

/// Create the permanent storage backend from configuration
pub async fn create_storage(config: &Config) -> StorageResult<Arc<dyn Storage>> {
    let storage = LocalStorage::new(
        config.local_storage_path().clone(),
        config.local_storage_base_url().to_string(),
    )
    .await?;

    tracing::info!(
        path = %config.local_storage_path().display(),
        "Permanent storage ready"
    );

    Ok(Arc::new(storage))
}

/// Create the staging chunk store from configuration
pub async fn create_chunk_store(config: &Config) -> StorageResult<Arc<dyn ChunkStore>> {
    let store = LocalChunkStore::new(config.chunk_staging_path().clone()).await?;

    tracing::info!(
        path = %config.chunk_staging_path().display(),
        "Chunk staging ready"
    );

    Ok(Arc::new(store))
}
