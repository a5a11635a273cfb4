//! Dependencies shared by processing runs

use std::sync::Arc;

use tessera_core::ThumbnailSize;
use tessera_db::MetadataStore;
use tessera_storage::Storage;

/// What a worker needs to process one upload.
///
/// Cheap to clone; every worker holds its own copy.
#[derive(Clone)]
pub struct ProcessingContext {
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn Storage>,
    pub thumbnail_sizes: Arc<[ThumbnailSize]>,
}

impl ProcessingContext {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn Storage>,
        thumbnail_sizes: Vec<ThumbnailSize>,
    ) -> Self {
        Self {
            metadata,
            storage,
            thumbnail_sizes: thumbnail_sizes.into(),
        }
    }
}
