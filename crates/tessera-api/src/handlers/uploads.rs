//! JSON records API for finished and in-flight uploads

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tessera_core::models::{
    ProcessingStatus, UpdateUploadRequest, UploadRecord, UploadRecordPatch, UploadRecordResponse,
};
use tessera_core::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;

fn not_found(upload_id: &str) -> AppError {
    AppError::NotFound(format!("Upload {} not found", upload_id))
}

/// Record owned by `principal`; anything else reads as missing.
async fn owned_record(
    state: &AppState,
    upload_id: &str,
    principal: Uuid,
) -> Result<UploadRecord, AppError> {
    state
        .metadata
        .find_by_id(upload_id)
        .await?
        .filter(|record| record.is_owned_by(principal))
        .ok_or_else(|| not_found(upload_id))
}

/// List the caller's uploads
#[utoipa::path(
    get,
    path = "/api/v0/uploads",
    tag = "uploads",
    responses(
        (status = 200, description = "Uploads owned by the caller, newest first", body = Vec<UploadRecordResponse>),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn list_uploads(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpAppError> {
    let records = state.metadata.list_by_owner(user.user_id).await?;
    let body: Vec<UploadRecordResponse> = records.into_iter().map(Into::into).collect();
    Ok(Json(body))
}

/// Get one upload
#[utoipa::path(
    get,
    path = "/api/v0/uploads/{upload_id}",
    tag = "uploads",
    params(("upload_id" = String, Path, description = "Upload ID")),
    responses(
        (status = 200, description = "Upload record", body = UploadRecordResponse),
        (status = 404, description = "Not found or not visible to the caller", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_upload(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let record = state
        .metadata
        .find_by_id(&upload_id)
        .await?
        .filter(|record| record.is_visible_to(user.user_id))
        .ok_or_else(|| not_found(&upload_id))?;
    Ok(Json(UploadRecordResponse::from(record)))
}

/// Update editable fields of an upload
#[utoipa::path(
    patch,
    path = "/api/v0/uploads/{upload_id}",
    tag = "uploads",
    params(("upload_id" = String, Path, description = "Upload ID")),
    request_body = UpdateUploadRequest,
    responses(
        (status = 200, description = "Updated record", body = UploadRecordResponse),
        (status = 400, description = "Invalid body", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state, request), fields(user_id = %user.user_id))]
pub async fn update_upload(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    ValidatedJson(request): ValidatedJson<UpdateUploadRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    request.validate().map_err(AppError::from)?;
    let record = owned_record(&state, &upload_id, user.user_id).await?;

    let patch = request.into_patch();
    if patch.is_empty() {
        return Ok(Json(UploadRecordResponse::from(record)));
    }
    let updated = state.metadata.update(&upload_id, &patch).await?;
    tracing::info!(upload_id = %upload_id, "Upload record updated");
    Ok(Json(UploadRecordResponse::from(updated)))
}

/// Delete a finished upload with its file and variants
#[utoipa::path(
    delete,
    path = "/api/v0/uploads/{upload_id}",
    tag = "uploads",
    params(("upload_id" = String, Path, description = "Upload ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Upload still in progress or processing", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn delete_upload_record(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let record = owned_record(&state, &upload_id, user.user_id).await?;

    if !record.is_finalized() {
        return Err(AppError::Conflict(format!(
            "Upload {} is still in progress; cancel it with DELETE /tus/{}",
            upload_id, upload_id
        ))
        .into());
    }
    if !record.processing_status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Upload {} is {}; delete it once processing has finished",
            upload_id, record.processing_status
        ))
        .into());
    }

    for key in record.processed_variants.values() {
        state.storage.delete(key).await?;
    }
    if let Some(file) = &record.file {
        state.storage.delete(file).await?;
    }
    state.metadata.delete(&upload_id).await?;

    tracing::info!(
        upload_id = %upload_id,
        variants = record.processed_variants.len(),
        "Upload deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Run processing again for a failed upload
#[utoipa::path(
    post,
    path = "/api/v0/uploads/{upload_id}/retry",
    tag = "uploads",
    params(("upload_id" = String, Path, description = "Upload ID")),
    responses(
        (status = 202, description = "Processing queued", body = UploadRecordResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Upload is not in the failed state", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state), fields(user_id = %user.user_id))]
pub async fn retry_processing(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    owned_record(&state, &upload_id, user.user_id).await?;

    let patch = UploadRecordPatch {
        processing_error: Some(None),
        ..Default::default()
    };
    let record = state
        .metadata
        .transition_status(
            &upload_id,
            ProcessingStatus::Failed,
            ProcessingStatus::Pending,
            &patch,
        )
        .await?
        .ok_or_else(|| {
            AppError::Conflict(format!(
                "Upload {} is not in the failed state",
                upload_id
            ))
        })?;

    if !state.queue.enqueue(&upload_id) {
        tracing::info!(upload_id = %upload_id, "Retry not queued now, the sweeper will offer it again");
    }
    tracing::info!(upload_id = %upload_id, "Processing retry requested");
    Ok((StatusCode::ACCEPTED, Json(UploadRecordResponse::from(record))))
}
