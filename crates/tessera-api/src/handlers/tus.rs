//! Resumable upload protocol endpoints under `/tus`.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{IntoHeaderName, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LOCATION},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tessera_core::constants::{
    HEADER_TUS_EXTENSION, HEADER_TUS_MAX_SIZE, HEADER_TUS_VERSION, HEADER_UPLOAD_DEFER_LENGTH,
    HEADER_UPLOAD_EXPIRES, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET,
    OFFSET_OCTET_STREAM,
};
use tessera_core::models::UploadMetadata;
use tessera_core::AppError;
use tokio_util::io::StreamReader;

use crate::auth::AuthUser;
use crate::error::{ErrorResponse, HttpAppError};
use crate::services::tus::{AppendChunk, CreateUpload, UploadLength};
use crate::state::AppState;

/// RFC 7231 HTTP-date
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| AppError::InvalidRequest(format!("{} is not valid ASCII", name)))
        })
        .transpose()
}

/// Parse a header carrying a non-negative integer.
fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, AppError> {
    header_str(headers, name)?
        .map(|value| {
            value.parse::<u64>().map_err(|_| {
                AppError::InvalidRequest(format!(
                    "{} must be a non-negative integer, got '{}'",
                    name, value
                ))
            })
        })
        .transpose()
}

fn insert<K: IntoHeaderName>(headers: &mut HeaderMap, name: K, value: String) -> Result<(), AppError> {
    let value = HeaderValue::from_str(&value)
        .map_err(|e| AppError::Internal(format!("Invalid response header value: {}", e)))?;
    headers.insert(name, value);
    Ok(())
}

fn insert_expires(headers: &mut HeaderMap, expires_at: Option<DateTime<Utc>>) -> Result<(), AppError> {
    match expires_at {
        Some(at) => insert(headers, HEADER_UPLOAD_EXPIRES, http_date(at)),
        None => Ok(()),
    }
}

/// Advertise protocol capabilities
#[utoipa::path(
    options,
    path = "/tus",
    tag = "tus",
    responses(
        (status = 204, description = "Supported version, size limit and extensions")
    )
)]
pub async fn options_upload(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpAppError> {
    let capabilities = state.tus.capabilities();
    let mut headers = HeaderMap::new();
    insert(&mut headers, HEADER_TUS_VERSION, capabilities.version.to_string())?;
    insert(&mut headers, HEADER_TUS_MAX_SIZE, capabilities.max_size.to_string())?;
    insert(&mut headers, HEADER_TUS_EXTENSION, capabilities.extensions.join(","))?;
    Ok((StatusCode::NO_CONTENT, headers))
}

/// Create an upload
#[utoipa::path(
    post,
    path = "/tus",
    tag = "tus",
    params(
        ("Upload-Length" = Option<u64>, Header, description = "Total size in bytes"),
        ("Upload-Defer-Length" = Option<String>, Header, description = "Set to 1 to declare the size later"),
        ("Upload-Metadata" = Option<String>, Header, description = "Comma-separated key/base64 pairs")
    ),
    responses(
        (status = 201, description = "Upload created; URL in Location"),
        (status = 400, description = "Invalid headers or metadata", body = ErrorResponse),
        (status = 413, description = "Upload-Length exceeds Tus-Max-Size", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_upload(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpAppError> {
    let length = header_u64(&headers, HEADER_UPLOAD_LENGTH)?;
    let deferred = header_str(&headers, HEADER_UPLOAD_DEFER_LENGTH)?;
    let length = match (length, deferred) {
        (Some(_), Some(_)) => {
            return Err(AppError::InvalidRequest(
                "Send either Upload-Length or Upload-Defer-Length, not both".to_string(),
            )
            .into())
        }
        (Some(length), None) => UploadLength::Fixed(length),
        (None, Some("1")) => UploadLength::Deferred,
        (None, Some(other)) => {
            return Err(AppError::InvalidRequest(format!(
                "Upload-Defer-Length must be 1, got '{}'",
                other
            ))
            .into())
        }
        (None, None) => {
            return Err(AppError::InvalidRequest(
                "Upload-Length or Upload-Defer-Length is required".to_string(),
            )
            .into())
        }
    };
    let metadata = match header_str(&headers, HEADER_UPLOAD_METADATA)? {
        Some(value) => UploadMetadata::from_header(value)?,
        None => UploadMetadata::default(),
    };

    let created = state
        .tus
        .create(CreateUpload {
            length,
            metadata,
            owner: user.user_id,
        })
        .await?;

    let mut response_headers = HeaderMap::new();
    insert(&mut response_headers, LOCATION, created.location)?;
    insert_expires(&mut response_headers, created.expires_at)?;
    Ok((StatusCode::CREATED, response_headers))
}

/// Current offset of an upload
#[utoipa::path(
    head,
    path = "/tus/{upload_id}",
    tag = "tus",
    params(("upload_id" = String, Path, description = "Upload ID")),
    responses(
        (status = 200, description = "Upload-Offset and Upload-Length of the upload"),
        (status = 404, description = "Unknown, expired or cancelled upload")
    ),
    security(("bearer_auth" = []))
)]
pub async fn head_upload(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let info = state.tus.info(&upload_id, user.user_id).await?;

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    insert(&mut headers, HEADER_UPLOAD_OFFSET, info.offset.to_string())?;
    match info.total_size {
        Some(total) => insert(&mut headers, HEADER_UPLOAD_LENGTH, total.to_string())?,
        None => insert(&mut headers, HEADER_UPLOAD_DEFER_LENGTH, "1".to_string())?,
    }
    let metadata = info.metadata.to_header();
    if !metadata.is_empty() {
        insert(&mut headers, HEADER_UPLOAD_METADATA, metadata)?;
    }
    insert_expires(&mut headers, info.expires_at)?;
    Ok((StatusCode::OK, headers))
}

/// Append bytes at the current offset
#[utoipa::path(
    patch,
    path = "/tus/{upload_id}",
    tag = "tus",
    params(
        ("upload_id" = String, Path, description = "Upload ID"),
        ("Upload-Offset" = u64, Header, description = "Offset the body starts at"),
        ("Upload-Length" = Option<u64>, Header, description = "Total size, for deferred-length uploads")
    ),
    request_body(content = Vec<u8>, content_type = "application/offset+octet-stream"),
    responses(
        (status = 204, description = "Bytes stored; new offset in Upload-Offset"),
        (status = 404, description = "Unknown, expired or cancelled upload", body = ErrorResponse),
        (status = 409, description = "Offset mismatch, concurrent write or completed upload", body = ErrorResponse),
        (status = 413, description = "Body exceeds the remaining length", body = ErrorResponse),
        (status = 415, description = "Wrong Content-Type", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
pub async fn patch_upload(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, HttpAppError> {
    let content_type = header_str(&headers, CONTENT_TYPE.as_str())?.unwrap_or_default();
    if !content_type.eq_ignore_ascii_case(OFFSET_OCTET_STREAM) {
        return Err(AppError::UnsupportedMediaType(format!(
            "Content-Type must be {}",
            OFFSET_OCTET_STREAM
        ))
        .into());
    }
    let offset = header_u64(&headers, HEADER_UPLOAD_OFFSET)?
        .ok_or_else(|| AppError::InvalidRequest("Upload-Offset is required".to_string()))?;

    let request = AppendChunk {
        upload_id,
        principal: user.user_id,
        offset,
        content_length: header_u64(&headers, CONTENT_LENGTH.as_str())?,
        declared_length: header_u64(&headers, HEADER_UPLOAD_LENGTH)?,
    };

    let mut reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let outcome = state.tus.append(request, &mut reader).await?;

    let mut response_headers = HeaderMap::new();
    insert(&mut response_headers, HEADER_UPLOAD_OFFSET, outcome.offset.to_string())?;
    insert_expires(&mut response_headers, outcome.expires_at)?;
    Ok((StatusCode::NO_CONTENT, response_headers))
}

/// Cancel an in-flight upload
#[utoipa::path(
    delete,
    path = "/tus/{upload_id}",
    tag = "tus",
    params(("upload_id" = String, Path, description = "Upload ID")),
    responses(
        (status = 204, description = "Upload cancelled"),
        (status = 404, description = "Unknown upload", body = ErrorResponse),
        (status = 409, description = "Upload already completed or cancelled, or busy", body = ErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_upload(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    state.tus.cancel(&upload_id, user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_http_date() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(http_date(at), "Tue, 05 Mar 2024 07:08:09 GMT");
    }

    #[test]
    fn test_header_u64() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_UPLOAD_OFFSET, HeaderValue::from_static("42"));
        headers.insert(HEADER_UPLOAD_LENGTH, HeaderValue::from_static("-1"));
        assert_eq!(header_u64(&headers, HEADER_UPLOAD_OFFSET).unwrap(), Some(42));
        assert!(header_u64(&headers, HEADER_UPLOAD_LENGTH).is_err());
        assert_eq!(header_u64(&headers, HEADER_UPLOAD_DEFER_LENGTH).unwrap(), None);
    }
}
