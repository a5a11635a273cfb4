//! Router assembly

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use tessera_core::constants::{
    HEADER_TUS_EXTENSION, HEADER_TUS_MAX_SIZE, HEADER_TUS_RESUMABLE, HEADER_TUS_VERSION,
    HEADER_UPLOAD_DEFER_LENGTH, HEADER_UPLOAD_EXPIRES, HEADER_UPLOAD_LENGTH,
    HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET,
};
use tessera_core::Config;
use tessera_infra::{request_id_middleware, REQUEST_ID_HEADER};
use tower::{service_fn, ServiceExt};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::api_doc::ApiDoc;
use crate::auth::auth_middleware;
use crate::handlers::{health, tus, uploads};
use crate::middleware::tus_resumable_middleware;
use crate::state::AppState;

/// Headers browsers may read from protocol responses
const EXPOSED_HEADERS: [&str; 10] = [
    HEADER_TUS_RESUMABLE,
    HEADER_TUS_VERSION,
    HEADER_TUS_MAX_SIZE,
    HEADER_TUS_EXTENSION,
    HEADER_UPLOAD_OFFSET,
    HEADER_UPLOAD_LENGTH,
    HEADER_UPLOAD_DEFER_LENGTH,
    HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_EXPIRES,
    REQUEST_ID_HEADER,
];

/// Protocol routes. Version negotiation wraps authentication so that every
/// response, 401 included, carries `Tus-Resumable`.
fn tus_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tus",
            post(tus::create_upload).options(tus::options_upload),
        )
        .route(
            "/tus/{upload_id}",
            axum::routing::head(tus::head_upload)
                .patch(tus::patch_upload)
                .delete(tus::delete_upload)
                .options(tus::options_upload),
        )
        .layer(from_fn_with_state(state, auth_middleware))
        .layer(from_fn(tus_resumable_middleware))
}

fn upload_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v0/uploads", get(uploads::list_uploads))
        .route(
            "/api/v0/uploads/{upload_id}",
            get(uploads::get_upload)
                .patch(uploads::update_upload)
                .delete(uploads::delete_upload_record),
        )
        .route(
            "/api/v0/uploads/{upload_id}/retry",
            post(uploads::retry_processing),
        )
        .layer(from_fn_with_state(state, auth_middleware))
}

fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
}

/// Only OPTIONS with `Origin` and `Access-Control-Request-Method` is a CORS
/// preflight; a bare OPTIONS is protocol capability discovery.
fn is_cors_preflight(request: &Request) -> bool {
    let headers = request.headers();
    request.method() == Method::OPTIONS
        && headers.contains_key(header::ORIGIN)
        && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

/// Setup all application routes
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Result<Router<()>, anyhow::Error> {
    let cors = setup_cors(config)?;
    let body_limit = usize::try_from(config.max_upload_size_bytes()).unwrap_or(usize::MAX);

    let app = public_routes()
        .merge(tus_routes(state.clone()))
        .merge(upload_routes(state.clone()))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    // CorsLayer answers every OPTIONS itself, so capability requests bypass it.
    let with_cors = app.clone().layer(cors);
    let dispatch = service_fn(move |request: Request| {
        let target = if request.method() == Method::OPTIONS && !is_cors_preflight(&request) {
            app.clone()
        } else {
            with_cors.clone()
        };
        target.oneshot(request)
    });

    Ok(Router::new()
        .fallback_service(dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware)))
}

fn setup_cors(config: &Config) -> Result<CorsLayer, anyhow::Error> {
    let methods = [
        Method::GET,
        Method::HEAD,
        Method::POST,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let exposed: Vec<HeaderName> = EXPOSED_HEADERS
        .iter()
        .map(|name| HeaderName::from_static(name))
        .chain([header::LOCATION])
        .collect();

    let origin = if config.cors_origins().iter().any(|o| o == "*") {
        tracing::warn!("CORS configured to allow all origins - not recommended for production");
        AllowOrigin::from(Any)
    } else {
        let origins = config
            .cors_origins()
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS origin: {}", e))?;
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(Any)
        .expose_headers(exposed))
}
