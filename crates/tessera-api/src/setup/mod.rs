//! Application setup and initialization

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use std::sync::Arc;

use anyhow::{Context, Result};
use tessera_core::Config;
use tessera_infra::LogFormat;

use crate::state::AppState;

/// Initialize the entire application
pub async fn initialize_app(config: Config) -> Result<(Arc<AppState>, axum::Router)> {
    // Validate configuration first - fail fast on misconfiguration
    config.validate().context("Configuration validation failed")?;

    let log_format = std::env::var("LOG_FORMAT")
        .ok()
        .map(|value| value.parse::<LogFormat>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid LOG_FORMAT: {}", e))?
        .unwrap_or(if config.is_production() {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        });
    tessera_infra::init_telemetry("tessera-api", log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        environment = %config.environment(),
        "Configuration loaded and validated successfully"
    );

    let metadata = database::setup_metadata_store(&config).await?;
    let state = services::initialize_services(&config, metadata).await?;
    let router = routes::setup_routes(&config, state.clone())?;

    Ok((state, router))
}
