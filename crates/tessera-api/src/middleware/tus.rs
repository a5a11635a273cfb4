//! Protocol version negotiation for the `/tus` routes

use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tessera_core::constants::{HEADER_TUS_RESUMABLE, TUS_VERSION};
use tessera_core::AppError;

use crate::error::HttpAppError;

/// Require `Tus-Resumable: 1.0.0` on every request except OPTIONS, and stamp
/// the header on every response, errors included.
pub async fn tus_resumable_middleware(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        next.run(request).await
    } else {
        match request
            .headers()
            .get(HEADER_TUS_RESUMABLE)
            .map(|v| v.to_str().unwrap_or_default())
        {
            Some(TUS_VERSION) => next.run(request).await,
            Some(other) => HttpAppError(AppError::UnsupportedVersion(format!(
                "Tus-Resumable {} is not supported",
                other
            )))
            .into_response(),
            None => HttpAppError(AppError::UnsupportedVersion(
                "Missing Tus-Resumable header".to_string(),
            ))
            .into_response(),
        }
    };

    response
        .headers_mut()
        .insert(HEADER_TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::any, Router};
    use tessera_core::constants::HEADER_TUS_VERSION;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/tus", any(|| async { StatusCode::NO_CONTENT }))
            .layer(middleware::from_fn(tus_resumable_middleware))
    }

    fn request(method: Method, version: Option<&str>) -> Request {
        let mut builder = Request::builder().method(method).uri("/tus");
        if let Some(version) = version {
            builder = builder.header(HEADER_TUS_RESUMABLE, version);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_matching_version_passes() {
        let response = app()
            .oneshot(request(Method::HEAD, Some("1.0.0")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[HEADER_TUS_RESUMABLE], "1.0.0");
    }

    #[tokio::test]
    async fn test_missing_or_wrong_version_is_rejected() {
        for version in [None, Some("0.2.2")] {
            let response = app()
                .oneshot(request(Method::PATCH, version))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
            assert_eq!(response.headers()[HEADER_TUS_VERSION], "1.0.0");
            assert_eq!(response.headers()[HEADER_TUS_RESUMABLE], "1.0.0");
        }
    }

    #[tokio::test]
    async fn test_options_needs_no_version() {
        let response = app().oneshot(request(Method::OPTIONS, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[HEADER_TUS_RESUMABLE], "1.0.0");
    }
}
