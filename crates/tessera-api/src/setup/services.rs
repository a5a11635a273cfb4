//! Service wiring: storage, processing queue, upload sessions, sweeper

use std::sync::Arc;

use anyhow::{Context, Result};
use tessera_core::Config;
use tessera_db::MetadataStore;
use tessera_storage::{create_chunk_store, create_storage};
use tessera_worker::{ProcessingContext, ProcessingQueue, ProcessingQueueConfig};

use crate::auth::JwtVerifier;
use crate::services::tus::{spawn_sweeper, TusService, TusSettings, UploadRegistry};
use crate::state::AppState;

/// Build every service, restore in-flight uploads and start the sweeper.
pub async fn initialize_services(
    config: &Config,
    metadata: Arc<dyn MetadataStore>,
) -> Result<Arc<AppState>> {
    let storage = create_storage(config)
        .await
        .context("Failed to initialize storage")?;
    let chunks = create_chunk_store(config)
        .await
        .context("Failed to initialize chunk staging")?;

    let queue_config = ProcessingQueueConfig::from(config);
    tracing::info!(
        max_workers = queue_config.max_workers,
        queue_size = queue_config.queue_size,
        max_attempts = queue_config.max_attempts,
        "Processing queue configured"
    );
    let queue = ProcessingQueue::new(
        ProcessingContext::new(
            metadata.clone(),
            storage.clone(),
            config.thumbnail_sizes().to_vec(),
        ),
        queue_config,
    );

    let tus = Arc::new(TusService::new(
        UploadRegistry::new(config.cancelled_id_memory()),
        chunks,
        storage.clone(),
        metadata.clone(),
        queue.clone(),
        TusSettings::from(config),
    ));
    tus.restore()
        .await
        .context("Failed to restore upload sessions")?;
    spawn_sweeper(tus.clone(), config.sweep_interval());

    Ok(Arc::new(AppState {
        config: config.clone(),
        metadata,
        storage,
        tus,
        queue,
        jwt: JwtVerifier::new(config.jwt_secret()),
    }))
}
