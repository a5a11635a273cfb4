use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tessera_core::AppError;

use crate::error::HttpAppError;
use crate::state::AppState;

/// Resolve the bearer token into an [`AuthUser`](crate::auth::AuthUser) extension.
///
/// OPTIONS passes through unauthenticated so capability discovery and CORS
/// preflight work without credentials.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) => token.trim(),
            None => {
                return HttpAppError(AppError::Unauthorized(
                    "Authorization header must use the Bearer scheme".to_string(),
                ))
                .into_response();
            }
        },
        None => {
            return HttpAppError(AppError::Unauthorized(
                "Missing authorization header".to_string(),
            ))
            .into_response();
        }
    };

    match state.jwt.verify(token) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => HttpAppError(e).into_response(),
    }
}
