//! Shared application state handed to every handler.

use std::sync::Arc;

use tessera_core::Config;
use tessera_db::MetadataStore;
use tessera_storage::Storage;
use tessera_worker::ProcessingQueue;

use crate::auth::JwtVerifier;
use crate::services::TusService;

pub struct AppState {
    pub config: Config,
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn Storage>,
    pub tus: Arc<TusService>,
    pub queue: ProcessingQueue,
    pub jwt: JwtVerifier,
}
