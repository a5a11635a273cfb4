//! Test helpers: build the application router over temp directories and an
//! in-memory metadata store.
//!
//! Run from workspace root: `cargo test -p tessera-api`.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue};
use axum_test::{TestRequest, TestServer};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::Value;
use tempfile::TempDir;
use tessera_api::auth::JwtClaims;
use tessera_api::setup::{routes, services};
use tessera_api::state::AppState;
use tessera_core::{BaseConfig, Config, ThumbnailSize, UploadServiceConfig};
use tessera_db::{InMemoryMetadataStore, MetadataStore};
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";
pub const TUS_RESUMABLE: &str = "1.0.0";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Test application: server, shared state and the directories it writes to.
pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub _staging: TempDir,
    pub _storage: TempDir,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }
}

pub fn test_config(staging: &TempDir, storage: &TempDir) -> UploadServiceConfig {
    let mut config = UploadServiceConfig::default();
    config.base = BaseConfig {
        jwt_secret: TEST_JWT_SECRET.to_string(),
        environment: "test".to_string(),
        ..config.base
    };
    config.chunk_staging_path = staging.path().to_path_buf();
    config.local_storage_path = storage.path().to_path_buf();
    config.local_storage_base_url = "http://localhost:4000/files".to_string();
    config.max_upload_size_bytes = 1024 * 1024;
    config.sweep_interval_secs = 3600;
    config.upload_lock_wait_ms = 200;
    config.processing_max_workers = 2;
    config.processing_retry_base_ms = 10;
    config.thumbnail_sizes = vec![ThumbnailSize::new(100, 100), ThumbnailSize::new(300, 300)];
    config
}

pub async fn setup_test_app() -> TestApp {
    setup_test_app_with(|_| {}).await
}

/// Setup with a hook to adjust configuration before services start.
pub async fn setup_test_app_with(adjust: impl FnOnce(&mut UploadServiceConfig)) -> TestApp {
    let staging = tempfile::tempdir().expect("Failed to create staging directory");
    let storage = tempfile::tempdir().expect("Failed to create storage directory");

    let mut upload_config = test_config(&staging, &storage);
    adjust(&mut upload_config);
    let config = Config(Box::new(upload_config));

    let metadata = Arc::new(InMemoryMetadataStore::new());
    let store: Arc<dyn MetadataStore> = metadata.clone();
    let state = services::initialize_services(&config, store)
        .await
        .expect("Failed to initialize services");
    let router = routes::setup_routes(&config, state.clone()).expect("Failed to build routes");
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        state,
        metadata,
        _staging: staging,
        _storage: storage,
    }
}

/// Signed HS256 token for `user`.
pub fn token_for(user: Uuid) -> String {
    let now = Utc::now().timestamp();
    let claims = JwtClaims {
        sub: user,
        iat: now,
        exp: now + 3600,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .expect("Failed to sign token")
}

fn value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).expect("Invalid header value")
}

/// Add `name: value` to a request.
pub fn with_header(request: TestRequest, name: &'static str, v: &str) -> TestRequest {
    request.add_header(HeaderName::from_static(name), value(v))
}

/// Bearer token plus `Tus-Resumable`.
pub fn tus(request: TestRequest, user: Uuid) -> TestRequest {
    request
        .add_header(header::AUTHORIZATION, value(&format!("Bearer {}", token_for(user))))
        .add_header(HeaderName::from_static("tus-resumable"), value(TUS_RESUMABLE))
}

pub fn authed(request: TestRequest, user: Uuid) -> TestRequest {
    request.add_header(header::AUTHORIZATION, value(&format!("Bearer {}", token_for(user))))
}

/// `Upload-Metadata` header value from plain pairs.
pub fn upload_metadata(pairs: &[(&str, &str)]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    pairs
        .iter()
        .map(|(key, v)| format!("{} {}", key, STANDARD.encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// POST /tus and return the upload id from `Location`.
pub async fn create_upload(app: &TestApp, user: Uuid, length: u64, metadata: &str) -> String {
    let mut request = tus(app.client().post("/tus"), user);
    request = with_header(request, "upload-length", &length.to_string());
    if !metadata.is_empty() {
        request = with_header(request, "upload-metadata", metadata);
    }
    let response = request.await;
    assert_eq!(response.status_code(), 201, "create failed: {}", response.text());
    let location = response.header(header::LOCATION);
    let location = location.to_str().expect("Location is not ASCII");
    location
        .strip_prefix("/tus/")
        .expect("Location outside /tus")
        .to_string()
}

/// PATCH a chunk at `offset`.
pub async fn patch_chunk(
    app: &TestApp,
    user: Uuid,
    upload_id: &str,
    offset: u64,
    chunk: &[u8],
) -> axum_test::TestResponse {
    let request = tus(app.client().patch(&format!("/tus/{}", upload_id)), user);
    with_header(request, "upload-offset", &offset.to_string())
        .content_type(OFFSET_OCTET_STREAM)
        .bytes(bytes::Bytes::copy_from_slice(chunk))
        .await
}

/// Fetch a record through the records API until `done` accepts it.
pub async fn wait_for_record(
    app: &TestApp,
    user: Uuid,
    upload_id: &str,
    done: impl Fn(&Value) -> bool,
) -> Value {
    let path = format!("/api/v0/uploads/{}", upload_id);
    for _ in 0..100 {
        let response = authed(app.client().get(&path), user).await;
        if response.status_code() == 200 {
            let body: Value = response.json();
            if done(&body) {
                return body;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Upload {} did not reach the expected state", upload_id);
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("Failed to encode PNG");
    out.into_inner()
}
