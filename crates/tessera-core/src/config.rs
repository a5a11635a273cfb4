//! Configuration module
//!
//! Settings are read from the environment (a `.env` file is honoured through
//! `dotenvy`). Every knob has a default except `JWT_SECRET`.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// Common constants
const SERVER_PORT: u16 = 4000;
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const MIN_JWT_SECRET_LEN: usize = 32;

// Upload protocol defaults
const MAX_UPLOAD_SIZE_BYTES: u64 = 104_857_600;
const UPLOAD_TTL_SECS: u64 = 86_400;
const SWEEP_INTERVAL_SECS: u64 = 300;
const UPLOAD_LOCK_WAIT_MS: u64 = 5_000;
const CANCELLED_ID_MEMORY: usize = 10_000;

// Processing defaults
const PROCESSING_MAX_WORKERS: usize = 4;
const PROCESSING_QUEUE_SIZE: usize = 1_000;
const PROCESSING_MAX_ATTEMPTS: u32 = 3;
const PROCESSING_RETRY_BASE_MS: u64 = 500;
const PROCESSING_TIMEOUT_SECS: u64 = 300;
const THUMBNAIL_SIZES: &str = "100x100,300x300";

/// Base configuration shared by every service binary
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub jwt_secret: String,
    pub environment: String,
}

/// A thumbnail bounding box, written `WIDTHxHEIGHT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Variant name used as the `processed_variants` key.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ThumbnailSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once('x')
            .ok_or_else(|| anyhow::anyhow!("Invalid thumbnail size '{}', expected WxH", s))?;
        let width: u32 = w.parse()?;
        let height: u32 = h.parse()?;
        if width == 0 || height == 0 {
            return Err(anyhow::anyhow!("Thumbnail size '{}' must be non-zero", s));
        }
        Ok(Self::new(width, height))
    }
}

/// Upload service configuration
#[derive(Clone, Debug)]
pub struct UploadServiceConfig {
    pub base: BaseConfig,
    /// PostgreSQL URL; without it records live in memory (development only)
    pub database_url: Option<String>,
    // Storage configuration
    pub local_storage_path: PathBuf,
    pub local_storage_base_url: String,
    pub chunk_staging_path: PathBuf,
    // Protocol configuration
    pub max_upload_size_bytes: u64,
    pub upload_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub upload_lock_wait_ms: u64,
    pub cancelled_id_memory: usize,
    // Processing configuration
    pub processing_max_workers: usize,
    pub processing_queue_size: usize,
    pub processing_max_attempts: u32,
    pub processing_retry_base_ms: u64,
    pub processing_timeout_secs: u64,
    pub thumbnail_sizes: Vec<ThumbnailSize>,
}

impl Default for UploadServiceConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig {
                server_port: SERVER_PORT,
                cors_origins: vec!["*".to_string()],
                db_max_connections: MAX_CONNECTIONS,
                db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
                jwt_secret: String::new(),
                environment: "development".to_string(),
            },
            database_url: None,
            local_storage_path: PathBuf::from("./data/uploads"),
            local_storage_base_url: format!("http://localhost:{}/files", SERVER_PORT),
            chunk_staging_path: PathBuf::from("./data/staging"),
            max_upload_size_bytes: MAX_UPLOAD_SIZE_BYTES,
            upload_ttl_secs: UPLOAD_TTL_SECS,
            sweep_interval_secs: SWEEP_INTERVAL_SECS,
            upload_lock_wait_ms: UPLOAD_LOCK_WAIT_MS,
            cancelled_id_memory: CANCELLED_ID_MEMORY,
            processing_max_workers: PROCESSING_MAX_WORKERS,
            processing_queue_size: PROCESSING_QUEUE_SIZE,
            processing_max_attempts: PROCESSING_MAX_ATTEMPTS,
            processing_retry_base_ms: PROCESSING_RETRY_BASE_MS,
            processing_timeout_secs: PROCESSING_TIMEOUT_SECS,
            thumbnail_sizes: vec![ThumbnailSize::new(100, 100), ThumbnailSize::new(300, 300)],
        }
    }
}

fn env_or<T: FromStr + ToString>(name: &str, default: T) -> T {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

impl UploadServiceConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let cors_origins_str = env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
        let is_production =
            environment.to_lowercase() == "production" || environment.to_lowercase() == "prod";
        if is_production && cors_origins_str.trim() == "*" {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS cannot be '*' in production. Please specify explicit origins."
            ));
        }

        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let server_port: u16 = env::var("PORT")
            .unwrap_or_else(|_| SERVER_PORT.to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?;

        let base = BaseConfig {
            server_port,
            cors_origins,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: env_or("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set for authentication"))?,
            environment,
        };

        let thumbnail_sizes = env::var("THUMBNAIL_SIZES")
            .unwrap_or_else(|_| THUMBNAIL_SIZES.to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<ThumbnailSize>, _>>()?;

        Ok(UploadServiceConfig {
            base,
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            local_storage_path: env::var("LOCAL_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_storage_path),
            local_storage_base_url: env::var("LOCAL_STORAGE_BASE_URL")
                .unwrap_or_else(|_| format!("http://localhost:{}/files", server_port)),
            chunk_staging_path: env::var("CHUNK_STAGING_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.chunk_staging_path),
            max_upload_size_bytes: env_or("TUS_MAX_SIZE_BYTES", MAX_UPLOAD_SIZE_BYTES),
            upload_ttl_secs: env_or("UPLOAD_TTL_SECS", UPLOAD_TTL_SECS),
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", SWEEP_INTERVAL_SECS),
            upload_lock_wait_ms: env_or("UPLOAD_LOCK_WAIT_MS", UPLOAD_LOCK_WAIT_MS),
            cancelled_id_memory: env_or("CANCELLED_ID_MEMORY", CANCELLED_ID_MEMORY),
            processing_max_workers: env_or("PROCESSING_MAX_WORKERS", PROCESSING_MAX_WORKERS),
            processing_queue_size: env_or("PROCESSING_QUEUE_SIZE", PROCESSING_QUEUE_SIZE),
            processing_max_attempts: env_or("PROCESSING_MAX_ATTEMPTS", PROCESSING_MAX_ATTEMPTS),
            processing_retry_base_ms: env_or("PROCESSING_RETRY_BASE_MS", PROCESSING_RETRY_BASE_MS),
            processing_timeout_secs: env_or("PROCESSING_TIMEOUT_SECS", PROCESSING_TIMEOUT_SECS),
            thumbnail_sizes,
        })
    }

    pub fn is_production(&self) -> bool {
        let env = self.base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.base.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(anyhow::anyhow!(
                "JWT_SECRET must be at least {} characters",
                MIN_JWT_SECRET_LEN
            ));
        }
        if self.is_production() && self.database_url.is_none() {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be set in production; the in-memory record store loses data on restart"
            ));
        }
        if self.max_upload_size_bytes == 0 {
            return Err(anyhow::anyhow!("TUS_MAX_SIZE_BYTES must be greater than 0"));
        }
        if self.upload_ttl_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "UPLOAD_TTL_SECS and SWEEP_INTERVAL_SECS must be greater than 0"
            ));
        }
        if self.processing_max_workers == 0 || self.processing_queue_size == 0 {
            return Err(anyhow::anyhow!(
                "PROCESSING_MAX_WORKERS and PROCESSING_QUEUE_SIZE must be greater than 0"
            ));
        }
        if self.processing_max_attempts == 0 {
            return Err(anyhow::anyhow!("PROCESSING_MAX_ATTEMPTS must be at least 1"));
        }
        if self.local_storage_path == self.chunk_staging_path {
            return Err(anyhow::anyhow!(
                "CHUNK_STAGING_PATH must differ from LOCAL_STORAGE_PATH"
            ));
        }
        Ok(())
    }
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<UploadServiceConfig>);

impl Config {
    fn inner(&self) -> &UploadServiceConfig {
        &self.0
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = UploadServiceConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.inner().validate()
    }

    pub fn is_production(&self) -> bool {
        self.inner().is_production()
    }

    // Convenience getters for common fields
    pub fn server_port(&self) -> u16 {
        self.inner().base.server_port
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.inner().base.cors_origins
    }

    pub fn jwt_secret(&self) -> &str {
        &self.inner().base.jwt_secret
    }

    pub fn environment(&self) -> &str {
        &self.inner().base.environment
    }

    pub fn database_url(&self) -> Option<&str> {
        self.inner().database_url.as_deref()
    }

    pub fn db_max_connections(&self) -> u32 {
        self.inner().base.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.inner().base.db_timeout_seconds
    }

    pub fn local_storage_path(&self) -> &PathBuf {
        &self.inner().local_storage_path
    }

    pub fn local_storage_base_url(&self) -> &str {
        &self.inner().local_storage_base_url
    }

    pub fn chunk_staging_path(&self) -> &PathBuf {
        &self.inner().chunk_staging_path
    }

    pub fn max_upload_size_bytes(&self) -> u64 {
        self.inner().max_upload_size_bytes
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.inner().upload_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.inner().sweep_interval_secs)
    }

    pub fn upload_lock_wait(&self) -> Duration {
        Duration::from_millis(self.inner().upload_lock_wait_ms)
    }

    pub fn cancelled_id_memory(&self) -> usize {
        self.inner().cancelled_id_memory
    }

    pub fn processing_max_workers(&self) -> usize {
        self.inner().processing_max_workers
    }

    pub fn processing_queue_size(&self) -> usize {
        self.inner().processing_queue_size
    }

    pub fn processing_max_attempts(&self) -> u32 {
        self.inner().processing_max_attempts
    }

    pub fn processing_retry_base(&self) -> Duration {
        Duration::from_millis(self.inner().processing_retry_base_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.inner().processing_timeout_secs)
    }

    pub fn thumbnail_sizes(&self) -> &[ThumbnailSize] {
        &self.inner().thumbnail_sizes
    }
}

impl From<UploadServiceConfig> for Config {
    fn from(config: UploadServiceConfig) -> Self {
        Config(Box::new(config))
    }
}
