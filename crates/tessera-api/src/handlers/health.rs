//! Liveness and readiness probes

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::state::AppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Run an async check with timeout; the error is "timeout" or "not_ready: {error}".
async fn run_check<F, E>(timeout: Duration, f: F) -> Result<(), String>
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match tokio::time::timeout(timeout, f).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("not_ready: {}", e)),
        Err(_) => Err("timeout".to_string()),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReadinessResponse {
    pub status: String,
    pub metadata: String,
    pub storage: String,
    pub active_uploads: usize,
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Process is running"))
)]
pub async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

/// Readiness probe: metadata store and storage
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Ready", body = ReadinessResponse),
        (status = 503, description = "A dependency is unavailable", body = ReadinessResponse)
    )
)]
pub async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metadata = run_check(CHECK_TIMEOUT, state.metadata.ping()).await;
    let storage = run_check(CHECK_TIMEOUT, async {
        state.storage.exists("health-check").await.map(|_| ())
    })
    .await;

    let ready = metadata.is_ok() && storage.is_ok();
    if let Err(e) = &metadata {
        tracing::error!(error = %e, "Metadata store readiness check failed");
    }
    if let Err(e) = &storage {
        tracing::error!(error = %e, "Storage readiness check failed");
    }

    let label = |result: Result<(), String>| result.map(|()| "ready".to_string()).unwrap_or_else(|e| e);
    let response = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        metadata: label(metadata),
        storage: label(storage),
        active_uploads: state.tus.registry().len().await,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
