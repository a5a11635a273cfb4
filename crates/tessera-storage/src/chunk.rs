//! Append-only staging files for in-flight uploads.
//!
//! Each session owns one file, `{staging}/{upload_id}.part`. The file length is
//! the number of durable bytes; callers never advance an offset past it.

use crate::keys::is_valid_upload_id;
use crate::traits::{Storage, StorageError, StorageResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Instant;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

const PART_SUFFIX: &str = ".part";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Durable per-session byte staging.
///
/// Implementations serialize nothing themselves; callers hold the session lock
/// around every mutating call.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Create an empty staging entry. Fails if one already exists.
    async fn create(&self, upload_id: &str) -> StorageResult<()>;

    /// Append everything `source` yields, up to `limit` bytes, and make it durable.
    ///
    /// Either all bytes are appended and synced, or the entry is restored to its
    /// previous length and an error is returned. A source that yields more than
    /// `limit` bytes fails with [`StorageError::LimitExceeded`]; a source that
    /// errors fails with [`StorageError::SourceInterrupted`].
    async fn append(
        &self,
        upload_id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        limit: u64,
    ) -> StorageResult<u64>;

    /// Number of durable bytes staged for `upload_id`
    async fn len(&self, upload_id: &str) -> StorageResult<u64>;

    /// Cut the entry back to `len` bytes
    async fn truncate(&self, upload_id: &str, len: u64) -> StorageResult<()>;

    /// Move the staged bytes into permanent storage under `storage_key`.
    /// The staging entry is gone afterwards.
    async fn promote(
        &self,
        upload_id: &str,
        storage: &dyn Storage,
        storage_key: &str,
    ) -> StorageResult<u64>;

    /// Remove the staged bytes without promoting them. Missing entries are ignored.
    async fn discard(&self, upload_id: &str) -> StorageResult<()>;

    /// Ids of every staged entry
    async fn list(&self) -> StorageResult<Vec<String>>;
}

/// [`ChunkStore`] backed by a local directory.
#[derive(Clone)]
pub struct LocalChunkStore {
    staging_path: PathBuf,
}

impl LocalChunkStore {
    pub async fn new(staging_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let staging_path = staging_path.into();

        fs::create_dir_all(&staging_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create staging directory {}: {}",
                staging_path.display(),
                e
            ))
        })?;

        Ok(Self { staging_path })
    }

    fn chunk_path(&self, upload_id: &str) -> StorageResult<PathBuf> {
        if !is_valid_upload_id(upload_id) {
            return Err(StorageError::InvalidKey(format!(
                "Invalid upload id '{}'",
                upload_id
            )));
        }
        Ok(self
            .staging_path
            .join(format!("{}{}", upload_id, PART_SUFFIX)))
    }

    fn not_found_or(upload_id: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(format!("No staged bytes for upload {}", upload_id))
        } else {
            StorageError::IoError(e)
        }
    }

    async fn copy_limited(
        file: &mut fs::File,
        source: &mut (dyn AsyncRead + Send + Unpin),
        limit: u64,
    ) -> StorageResult<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;

        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| StorageError::SourceInterrupted(e.to_string()))?;
            if n == 0 {
                break;
            }
            if written + n as u64 > limit {
                return Err(StorageError::LimitExceeded { limit });
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            written += n as u64;
        }

        file.flush()
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        file.sync_data()
            .await
            .map_err(|e| StorageError::WriteFailed(format!("fsync failed: {}", e)))?;

        Ok(written)
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn create(&self, upload_id: &str) -> StorageResult<()> {
        let path = self.chunk_path(upload_id)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                StorageError::WriteFailed(format!(
                    "Failed to create staging file {}: {}",
                    path.display(),
                    e
                ))
            })?;
        file.sync_all().await?;
        Ok(())
    }

    async fn append(
        &self,
        upload_id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
        limit: u64,
    ) -> StorageResult<u64> {
        let path = self.chunk_path(upload_id)?;
        let start = Instant::now();

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::not_found_or(upload_id, e))?;
        let previous_len = file.metadata().await?.len();

        match Self::copy_limited(&mut file, source, limit).await {
            Ok(written) => {
                tracing::debug!(
                    upload_id = %upload_id,
                    previous_len,
                    written,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Chunk appended"
                );
                Ok(written)
            }
            Err(err) => {
                if let Err(rollback) = file.set_len(previous_len).await {
                    tracing::error!(
                        upload_id = %upload_id,
                        error = %rollback,
                        "Failed to roll back partial chunk"
                    );
                    return Err(StorageError::WriteFailed(format!(
                        "{} (rollback failed: {})",
                        err, rollback
                    )));
                }
                let _ = file.sync_data().await;
                tracing::debug!(
                    upload_id = %upload_id,
                    previous_len,
                    error = %err,
                    "Chunk append rolled back"
                );
                Err(err)
            }
        }
    }

    async fn len(&self, upload_id: &str) -> StorageResult<u64> {
        let path = self.chunk_path(upload_id)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found_or(upload_id, e))?;
        Ok(meta.len())
    }

    async fn truncate(&self, upload_id: &str, len: u64) -> StorageResult<()> {
        let path = self.chunk_path(upload_id)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Self::not_found_or(upload_id, e))?;
        file.set_len(len).await?;
        file.sync_all().await?;
        tracing::debug!(upload_id = %upload_id, len, "Staging file truncated");
        Ok(())
    }

    async fn promote(
        &self,
        upload_id: &str,
        storage: &dyn Storage,
        storage_key: &str,
    ) -> StorageResult<u64> {
        let path = self.chunk_path(upload_id)?;
        storage.ingest(storage_key, &path).await
    }

    async fn discard(&self, upload_id: &str) -> StorageResult<()> {
        let path = self.chunk_path(upload_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed(format!(
                "Failed to remove staging file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.staging_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(PART_SUFFIX) {
                if is_valid_upload_id(id) {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }
}
