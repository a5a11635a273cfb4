//! Storage abstraction traits
//!
//! This module defines the permanent [`Storage`] trait and the shared error type.

use std::path::Path;

use async_trait::async_trait;
use tessera_core::AppError;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// The request body ended or failed before all bytes arrived
    #[error("Source interrupted: {0}")]
    SourceInterrupted(String),

    /// The source produced more bytes than allowed
    #[error("Append limit of {limit} bytes exceeded")]
    LimitExceeded { limit: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => AppError::NotFound(msg),
            StorageError::InvalidKey(msg) => AppError::NotFound(msg),
            StorageError::SourceInterrupted(msg) => {
                AppError::InvalidRequest(format!("Request body ended prematurely: {}", msg))
            }
            StorageError::LimitExceeded { limit } => AppError::SizeExceeded(format!(
                "Request body exceeds the {} bytes remaining for this upload",
                limit
            )),
            StorageError::ConfigError(msg) => AppError::Internal(msg),
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Permanent storage for finished uploads and derived variants.
///
/// Keys are produced by the `keys` module; backends reject keys that could
/// escape their root.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `data` under `storage_key`, replacing any previous object. Returns its URL.
    async fn put(&self, storage_key: &str, data: Vec<u8>) -> StorageResult<String>;

    /// Read a whole object
    async fn get(&self, storage_key: &str) -> StorageResult<Vec<u8>>;

    /// Move a local file into storage under `storage_key`.
    ///
    /// The source file no longer exists once this returns `Ok`. Returns the object size.
    async fn ingest(&self, storage_key: &str, source: &Path) -> StorageResult<u64>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    /// Size in bytes of an object
    async fn content_length(&self, storage_key: &str) -> StorageResult<u64>;

    /// Public URL of an object
    fn url(&self, storage_key: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_to_app_error() {
        let app: AppError = StorageError::SourceInterrupted("eof".to_string()).into();
        assert!(matches!(app, AppError::InvalidRequest(_)));

        let app: AppError = StorageError::LimitExceeded { limit: 10 }.into();
        assert!(matches!(app, AppError::SizeExceeded(msg) if msg.contains("10")));

        let app: AppError = StorageError::WriteFailed("ENOSPC".to_string()).into();
        assert!(matches!(app, AppError::Storage(msg) if msg.contains("ENOSPC")));

        let io = std::io::Error::new(std::io::ErrorKind::Other, "EIO");
        let app: AppError = StorageError::from(io).into();
        assert!(app.is_storage_failure());
    }
}
