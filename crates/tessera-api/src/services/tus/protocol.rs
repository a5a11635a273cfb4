use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tessera_core::constants::{TUS_BASE_PATH, TUS_EXTENSIONS, TUS_VERSION};
use tessera_core::models::{UploadMetadata, UploadRecord, UploadRecordPatch};
use tessera_core::{AppError, Config};
use tessera_db::MetadataStore;
use tessera_storage::{keys, ChunkStore, Storage, StorageError};
use tessera_worker::ProcessingQueue;
use tokio::io::AsyncRead;
use uuid::Uuid;

use super::registry::{SessionEnd, UploadRegistry, UploadSession};

/// Fresh ids drawn before giving up on a collision streak.
const MAX_ID_ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
pub struct TusSettings {
    /// Largest accepted upload, advertised as `Tus-Max-Size`
    pub max_size: u64,
    /// Idle time after which an incomplete upload expires
    pub ttl: Duration,
    /// How long a cancel waits for an append in progress
    pub lock_wait: Duration,
}

impl From<&Config> for TusSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_size: config.max_upload_size_bytes(),
            ttl: config.upload_ttl(),
            lock_wait: config.upload_lock_wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLength {
    Fixed(u64),
    /// `Upload-Defer-Length: 1`; the length arrives with a later PATCH
    Deferred,
}

#[derive(Debug, Clone)]
pub struct CreateUpload {
    pub length: UploadLength,
    pub metadata: UploadMetadata,
    pub owner: Uuid,
}

#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub upload_id: String,
    /// Relative URL of the new upload, e.g. `/tus/{id}`
    pub location: String,
    /// `None` once the upload is finalized (zero-length uploads)
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub offset: u64,
    pub total_size: Option<u64>,
    pub metadata: UploadMetadata,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AppendChunk {
    pub upload_id: String,
    pub principal: Uuid,
    /// `Upload-Offset` sent by the client
    pub offset: u64,
    /// `Content-Length` of the body, when known
    pub content_length: Option<u64>,
    /// `Upload-Length` sent with the PATCH (deferred uploads)
    pub declared_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub offset: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub finalized: bool,
}

#[derive(Debug, Clone)]
pub struct Capabilities {
    pub version: &'static str,
    pub max_size: u64,
    pub extensions: &'static [&'static str],
}

pub struct TusService {
    pub(super) registry: UploadRegistry,
    pub(super) chunks: Arc<dyn ChunkStore>,
    pub(super) storage: Arc<dyn Storage>,
    pub(super) metadata: Arc<dyn MetadataStore>,
    pub(super) queue: ProcessingQueue,
    pub(super) settings: TusSettings,
}

fn not_found(upload_id: &str) -> AppError {
    AppError::NotFound(format!("Upload {} not found", upload_id))
}

fn already_complete(upload_id: &str) -> AppError {
    AppError::Conflict(format!("Upload {} is already complete", upload_id))
}

impl TusService {
    pub fn new(
        registry: UploadRegistry,
        chunks: Arc<dyn ChunkStore>,
        storage: Arc<dyn Storage>,
        metadata: Arc<dyn MetadataStore>,
        queue: ProcessingQueue,
        settings: TusSettings,
    ) -> Self {
        Self {
            registry,
            chunks,
            storage,
            metadata,
            queue,
            settings,
        }
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &TusSettings {
        &self.settings
    }

    /// Protocol version, size limit and extensions advertised on OPTIONS.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            version: TUS_VERSION,
            max_size: self.settings.max_size,
            extensions: TUS_EXTENSIONS,
        }
    }

    pub(super) fn expires_at(&self, last_activity_at: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.settings.ttl)
            .ok()
            .and_then(|ttl| last_activity_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub(super) fn is_expired(&self, last_activity_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expires_at(last_activity_at) <= now
    }

    /// Start a new upload.
    ///
    /// The session, the empty chunk and the record exist together or not at all.
    /// A zero-length upload is finalized before this returns.
    #[tracing::instrument(skip(self, request), fields(owner = %request.owner, upload_id = tracing::field::Empty))]
    pub async fn create(&self, request: CreateUpload) -> Result<CreatedUpload, AppError> {
        let total_size = match request.length {
            UploadLength::Fixed(length) if length > self.settings.max_size => {
                return Err(AppError::SizeExceeded(format!(
                    "Upload-Length {} exceeds the maximum of {} bytes",
                    length, self.settings.max_size
                )));
            }
            UploadLength::Fixed(length) => Some(length),
            UploadLength::Deferred => None,
        };
        let file_type = request.metadata.file_type.unwrap_or_default();
        let visibility = request.metadata.visibility.unwrap_or_default();

        for _ in 0..MAX_ID_ATTEMPTS {
            let upload_id = UploadRegistry::generate_id()?;
            let record = UploadRecord::new(
                upload_id.clone(),
                request.owner,
                total_size,
                request.metadata.clone(),
                file_type,
                visibility,
            );

            let session = match self.registry.insert(record.clone()).await {
                Ok(session) => session,
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            };
            let guard = session.lock().await;

            if let Err(e) = self.persist_new(&record).await {
                self.registry.remove(&upload_id).await;
                drop(guard);
                match e {
                    AppError::Conflict(_) => {
                        tracing::warn!(upload_id = %upload_id, "Upload id already taken, drawing another");
                        continue;
                    }
                    other => return Err(other),
                }
            }

            tracing::Span::current().record("upload_id", upload_id.as_str());
            tracing::info!(
                total_size = ?total_size,
                file_type = %file_type,
                "Upload created"
            );

            let finalized = record.is_upload_complete();
            if finalized {
                self.finalize(&session).await?;
            }
            drop(guard);

            return Ok(CreatedUpload {
                location: format!("{}/{}", TUS_BASE_PATH, upload_id),
                expires_at: (!finalized).then(|| self.expires_at(record.last_activity_at)),
                upload_id,
            });
        }

        Err(AppError::Internal(
            "Could not allocate a unique upload id".to_string(),
        ))
    }

    /// Empty chunk first, then the record; the chunk is removed if the record fails.
    async fn persist_new(&self, record: &UploadRecord) -> Result<(), AppError> {
        let upload_id = record.upload_id.as_str();
        self.chunks.create(upload_id).await?;

        if let Err(e) = self.metadata.create(record).await {
            if let Err(discard) = self.chunks.discard(upload_id).await {
                tracing::warn!(
                    upload_id = %upload_id,
                    error = %discard,
                    "Failed to discard chunk of an upload that was never recorded"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Current offset and declared length, without waiting on an append in progress.
    pub async fn info(&self, upload_id: &str, principal: Uuid) -> Result<UploadInfo, AppError> {
        if let Some(session) = self.registry.get(upload_id).await {
            if session.owner() != principal {
                return Err(not_found(upload_id));
            }
            let state = session.snapshot().await;
            if matches!(
                state.ended,
                Some(SessionEnd::Cancelled) | Some(SessionEnd::Expired)
            ) {
                return Err(not_found(upload_id));
            }
            let record = state.record;
            return Ok(UploadInfo {
                offset: record.offset,
                total_size: record.total_size,
                expires_at: state
                    .ended
                    .is_none()
                    .then(|| self.expires_at(record.last_activity_at)),
                metadata: record.metadata,
            });
        }

        let record = self
            .metadata
            .find_by_id(upload_id)
            .await?
            .filter(|record| record.is_owned_by(principal) && record.is_finalized())
            .ok_or_else(|| not_found(upload_id))?;

        Ok(UploadInfo {
            offset: record.offset,
            total_size: record.total_size,
            metadata: record.metadata,
            expires_at: None,
        })
    }

    /// Append the body at the client's offset.
    ///
    /// The new offset is acknowledged only after both the chunk write and the
    /// record update succeed. If the record update fails the chunk is truncated
    /// back so the two never disagree.
    #[tracing::instrument(skip(self, request, body), fields(upload_id = %request.upload_id, offset = request.offset))]
    pub async fn append(
        &self,
        request: AppendChunk,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<AppendOutcome, AppError> {
        let upload_id = request.upload_id.as_str();
        let session = match self.registry.get(upload_id).await {
            Some(session) if session.owner() == request.principal => session,
            Some(_) => return Err(not_found(upload_id)),
            None => return Err(self.missing_session_error(upload_id, request.principal).await),
        };

        let _guard = session.try_lock().map_err(|_| {
            AppError::Conflict(format!(
                "Upload {} is being written by another request",
                upload_id
            ))
        })?;

        let state = session.snapshot().await;
        match state.ended {
            Some(SessionEnd::Finalized) => return Err(already_complete(upload_id)),
            Some(_) => return Err(not_found(upload_id)),
            None => {}
        }
        let record = state.record;

        if request.offset != record.offset {
            return Err(AppError::Conflict(format!(
                "Upload-Offset {} does not match the current offset {}",
                request.offset, record.offset
            )));
        }

        let total_size = self.resolve_length(&record, request.declared_length)?;
        let newly_declared = record.total_size.is_none() && total_size.is_some();
        let limit = match total_size {
            Some(total) => total - record.offset,
            None => self.settings.max_size.saturating_sub(record.offset),
        };
        if let Some(length) = request.content_length {
            if length > limit {
                return Err(AppError::SizeExceeded(format!(
                    "Content-Length {} exceeds the {} bytes remaining for this upload",
                    length, limit
                )));
            }
        }

        let written = if limit == 0 {
            0
        } else {
            self.chunks.append(upload_id, body, limit).await?
        };
        if let Some(expected) = request.content_length {
            if written != expected {
                if written > 0 {
                    self.chunks.truncate(upload_id, record.offset).await?;
                }
                return Err(AppError::InvalidRequest(format!(
                    "Body ended after {} of {} bytes declared in Content-Length",
                    written, expected
                )));
            }
        }
        let new_offset = record.offset + written;

        let mut patch = UploadRecordPatch::progress(new_offset, Utc::now());
        if newly_declared {
            patch.total_size = total_size;
        }
        let updated = match self.metadata.update(upload_id, &patch).await {
            Ok(updated) => updated,
            Err(e) => {
                if written > 0 {
                    if let Err(truncate) = self.chunks.truncate(upload_id, record.offset).await {
                        tracing::error!(
                            error = %truncate,
                            offset = record.offset,
                            "Failed to roll back chunk after record update failure"
                        );
                    }
                }
                return Err(e);
            }
        };
        session.set_record(updated.clone()).await;

        tracing::debug!(written, offset = new_offset, total_size = ?updated.total_size, "Chunk acknowledged");

        let finalized = updated.is_upload_complete();
        if finalized {
            self.finalize(&session).await?;
        }

        Ok(AppendOutcome {
            offset: new_offset,
            expires_at: (!finalized).then(|| self.expires_at(updated.last_activity_at)),
            finalized,
        })
    }

    /// Effective total size after an optional `Upload-Length` on PATCH.
    fn resolve_length(
        &self,
        record: &UploadRecord,
        declared: Option<u64>,
    ) -> Result<Option<u64>, AppError> {
        match (record.total_size, declared) {
            (Some(total), Some(length)) if total != length => Err(AppError::InvalidRequest(
                format!("Upload-Length is already set to {}", total),
            )),
            (Some(total), _) => Ok(Some(total)),
            (None, Some(length)) if length > self.settings.max_size => {
                Err(AppError::SizeExceeded(format!(
                    "Upload-Length {} exceeds the maximum of {} bytes",
                    length, self.settings.max_size
                )))
            }
            (None, Some(length)) if length < record.offset => Err(AppError::InvalidRequest(
                format!(
                    "Upload-Length {} is smaller than the current offset {}",
                    length, record.offset
                ),
            )),
            (None, length) => Ok(length),
        }
    }

    /// Error for an id with no live session: completed uploads conflict, anything else is unknown.
    async fn missing_session_error(&self, upload_id: &str, principal: Uuid) -> AppError {
        if self.registry.cancelled_owner(upload_id).is_some() {
            return not_found(upload_id);
        }
        match self.metadata.find_by_id(upload_id).await {
            Ok(Some(record)) if record.is_owned_by(principal) && record.is_finalized() => {
                already_complete(upload_id)
            }
            Ok(_) => not_found(upload_id),
            Err(e) => e,
        }
    }

    /// Abort an in-flight upload and release its resources.
    #[tracing::instrument(skip(self), fields(principal = %principal))]
    pub async fn cancel(&self, upload_id: &str, principal: Uuid) -> Result<(), AppError> {
        let session = match self.registry.get(upload_id).await {
            Some(session) if session.owner() == principal => session,
            Some(_) => return Err(not_found(upload_id)),
            None => {
                if self.registry.cancelled_owner(upload_id) == Some(principal) {
                    return Err(AppError::Conflict(format!(
                        "Upload {} was already cancelled",
                        upload_id
                    )));
                }
                return Err(match self.metadata.find_by_id(upload_id).await? {
                    Some(record) if record.is_owned_by(principal) && record.is_finalized() => {
                        already_complete(upload_id)
                    }
                    _ => not_found(upload_id),
                });
            }
        };

        let _guard = tokio::time::timeout(self.settings.lock_wait, session.lock())
            .await
            .map_err(|_| {
                AppError::Conflict(format!(
                    "Upload {} is busy, retry the cancellation",
                    upload_id
                ))
            })?;

        match session.snapshot().await.ended {
            Some(SessionEnd::Finalized) => return Err(already_complete(upload_id)),
            Some(SessionEnd::Cancelled) => {
                return Err(AppError::Conflict(format!(
                    "Upload {} was already cancelled",
                    upload_id
                )))
            }
            Some(SessionEnd::Expired) => return Err(not_found(upload_id)),
            None => {}
        }

        self.metadata.delete(upload_id).await?;
        if let Err(e) = self.chunks.discard(upload_id).await {
            tracing::warn!(
                error = %e,
                "Failed to discard chunk of cancelled upload, leaving it to the orphan sweep"
            );
        }
        session.end(SessionEnd::Cancelled).await;
        self.registry.remove(upload_id).await;
        self.registry.remember_cancelled(upload_id, principal);

        tracing::info!("Upload cancelled");
        Ok(())
    }

    /// Promote the chunk, record the storage key and hand the upload to processing.
    ///
    /// Callers hold the session lock and have observed `offset == total_size`.
    /// Safe to repeat after a partial failure: a chunk that is already gone but
    /// whose object exists in storage counts as promoted.
    pub(super) async fn finalize(&self, session: &UploadSession) -> Result<(), AppError> {
        let record = session.snapshot().await.record;
        let upload_id = record.upload_id.as_str();
        let storage_key = keys::upload_key(
            record.owner,
            upload_id,
            record.metadata.extension().as_deref(),
        );
        let start = Instant::now();

        if let Err(e) = self
            .chunks
            .promote(upload_id, self.storage.as_ref(), &storage_key)
            .await
        {
            let promoted = matches!(e, StorageError::NotFound(_))
                && self.storage.exists(&storage_key).await.unwrap_or(false);
            if !promoted {
                tracing::error!(upload_id = %upload_id, error = %e, "Failed to promote chunk");
                return Err(e.into());
            }
            tracing::info!(
                upload_id = %upload_id,
                key = %storage_key,
                "Chunk was promoted by an earlier attempt"
            );
        }

        let patch = UploadRecordPatch {
            file: Some(storage_key.clone()),
            ..Default::default()
        };
        let updated = self.metadata.update(upload_id, &patch).await?;
        session.set_record(updated).await;
        session.end(SessionEnd::Finalized).await;
        self.registry.remove(upload_id).await;

        tracing::info!(
            upload_id = %upload_id,
            key = %storage_key,
            size = record.offset,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Upload finalized"
        );

        if !self.queue.enqueue(upload_id) {
            tracing::info!(upload_id = %upload_id, "Processing not queued now, the sweeper will offer it again");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tessera_core::models::{ProcessingStatus, UploadRecordPatch};
    use tessera_db::InMemoryMetadataStore;
    use tessera_storage::{LocalChunkStore, LocalStorage};
    use tessera_worker::{ProcessingContext, ProcessingQueueConfig};
    use tempfile::TempDir;

    /// In-memory store whose updates can be made to fail on demand
    #[derive(Default)]
    pub(crate) struct FlakyMetadataStore {
        pub inner: InMemoryMetadataStore,
        pub fail_updates: AtomicBool,
    }

    #[async_trait]
    impl MetadataStore for FlakyMetadataStore {
        async fn create(&self, record: &UploadRecord) -> Result<(), AppError> {
            self.inner.create(record).await
        }

        async fn update(
            &self,
            upload_id: &str,
            patch: &UploadRecordPatch,
        ) -> Result<UploadRecord, AppError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.update(upload_id, patch).await
        }

        async fn delete(&self, upload_id: &str) -> Result<bool, AppError> {
            self.inner.delete(upload_id).await
        }

        async fn find_by_id(&self, upload_id: &str) -> Result<Option<UploadRecord>, AppError> {
            self.inner.find_by_id(upload_id).await
        }

        async fn transition_status(
            &self,
            upload_id: &str,
            from: ProcessingStatus,
            to: ProcessingStatus,
            patch: &UploadRecordPatch,
        ) -> Result<Option<UploadRecord>, AppError> {
            self.inner.transition_status(upload_id, from, to, patch).await
        }

        async fn list_by_owner(&self, owner: Uuid) -> Result<Vec<UploadRecord>, AppError> {
            self.inner.list_by_owner(owner).await
        }

        async fn list_unfinished(&self) -> Result<Vec<UploadRecord>, AppError> {
            self.inner.list_unfinished().await
        }

        async fn ping(&self) -> Result<(), AppError> {
            self.inner.ping().await
        }
    }

    pub(crate) struct Harness {
        pub service: TusService,
        pub metadata: Arc<FlakyMetadataStore>,
        pub chunks: Arc<LocalChunkStore>,
        pub storage: Arc<LocalStorage>,
        _staging: TempDir,
        _files: TempDir,
    }

    pub(crate) async fn harness(settings: TusSettings) -> Harness {
        let staging = tempfile::tempdir().unwrap();
        let files = tempfile::tempdir().unwrap();
        let chunks = Arc::new(LocalChunkStore::new(staging.path()).await.unwrap());
        let storage = Arc::new(
            LocalStorage::new(files.path(), "http://localhost/files".to_string())
                .await
                .unwrap(),
        );
        let metadata = Arc::new(FlakyMetadataStore::default());
        let queue = ProcessingQueue::new(
            ProcessingContext::new(metadata.clone(), storage.clone(), Vec::new()),
            ProcessingQueueConfig::default(),
        );
        let service = TusService::new(
            UploadRegistry::new(16),
            chunks.clone(),
            storage.clone(),
            metadata.clone(),
            queue,
            settings,
        );
        Harness {
            service,
            metadata,
            chunks,
            storage,
            _staging: staging,
            _files: files,
        }
    }

    pub(crate) fn settings() -> TusSettings {
        TusSettings {
            max_size: 1024,
            ttl: Duration::from_secs(3600),
            lock_wait: Duration::from_millis(200),
        }
    }

    fn create_request(owner: Uuid, length: UploadLength) -> CreateUpload {
        CreateUpload {
            length,
            metadata: UploadMetadata {
                filename: Some("notes.txt".to_string()),
                file_type: Some(tessera_core::models::FileType::Temp),
                ..Default::default()
            },
            owner,
        }
    }

    fn chunk(upload_id: &str, owner: Uuid, offset: u64, len: usize) -> AppendChunk {
        AppendChunk {
            upload_id: upload_id.to_string(),
            principal: owner,
            offset,
            content_length: Some(len as u64),
            declared_length: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_length() {
        let h = harness(settings()).await;
        let result = h
            .service
            .create(create_request(Uuid::new_v4(), UploadLength::Fixed(4096)))
            .await;
        assert!(matches!(result, Err(AppError::SizeExceeded(_))));
        assert!(h.service.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_append_until_complete_finalizes() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let created = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap();
        let id = created.upload_id.as_str();
        assert_eq!(created.location, format!("/tus/{}", id));
        assert!(created.expires_at.is_some());

        let outcome = h
            .service
            .append(chunk(id, owner, 0, 4), &mut &b"0123"[..])
            .await
            .unwrap();
        assert_eq!(outcome.offset, 4);
        assert!(!outcome.finalized);
        assert_eq!(h.service.info(id, owner).await.unwrap().offset, 4);

        let outcome = h
            .service
            .append(chunk(id, owner, 4, 6), &mut &b"456789"[..])
            .await
            .unwrap();
        assert!(outcome.finalized);
        assert!(outcome.expires_at.is_none());

        let record = h.metadata.find_by_id(id).await.unwrap().unwrap();
        let key = record.file.clone().unwrap();
        assert_eq!(h.storage.get(&key).await.unwrap(), b"0123456789");
        assert!(h.chunks.len(id).await.is_err());
        assert!(!h.service.registry().contains(id).await);

        let info = h.service.info(id, owner).await.unwrap();
        assert_eq!(info.offset, 10);
        assert!(matches!(
            h.service.append(chunk(id, owner, 10, 1), &mut &b"x"[..]).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_length_upload_finalizes_on_create() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let created = h
            .service
            .create(create_request(owner, UploadLength::Fixed(0)))
            .await
            .unwrap();
        assert!(created.expires_at.is_none());
        let record = h.metadata.find_by_id(&created.upload_id).await.unwrap().unwrap();
        assert!(record.is_finalized());
    }

    #[tokio::test]
    async fn test_offset_mismatch_and_foreign_owner() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap()
            .upload_id;

        assert!(matches!(
            h.service.append(chunk(&id, owner, 3, 2), &mut &b"ab"[..]).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            h.service
                .append(chunk(&id, Uuid::new_v4(), 0, 2), &mut &b"ab"[..])
                .await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.service.info(&id, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_while_locked_conflicts() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap()
            .upload_id;

        let session = h.service.registry().get(&id).await.unwrap();
        let guard = session.try_lock().unwrap();
        assert!(matches!(
            h.service.append(chunk(&id, owner, 0, 2), &mut &b"ab"[..]).await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(h.service.info(&id, owner).await.unwrap().offset, 0);
        drop(guard);
    }

    #[tokio::test]
    async fn test_racing_appends_exactly_one_wins() {
        use tokio::io::AsyncWriteExt;

        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap()
            .upload_id;

        // The first body only arrives after the second append has returned.
        let (mut writer, mut slow_body) = tokio::io::duplex(64);
        let first = h.service.append(chunk(&id, owner, 0, 4), &mut slow_body);
        let second = async {
            let result = h
                .service
                .append(chunk(&id, owner, 0, 4), &mut &b"wxyz"[..])
                .await;
            writer.write_all(b"abcd").await.unwrap();
            drop(writer);
            result
        };
        let (first, second) = tokio::join!(first, second);

        let outcomes = [&first, &second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(AppError::Conflict(_))))
                .count(),
            1
        );
        assert_eq!(h.service.info(&id, owner).await.unwrap().offset, 4);
        assert_eq!(h.chunks.len(&id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_body_longer_than_remaining_is_rejected() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(3)))
            .await
            .unwrap()
            .upload_id;

        assert!(matches!(
            h.service.append(chunk(&id, owner, 0, 5), &mut &b"abcde"[..]).await,
            Err(AppError::SizeExceeded(_))
        ));

        let mut request = chunk(&id, owner, 0, 0);
        request.content_length = None;
        assert!(matches!(
            h.service.append(request, &mut &b"abcde"[..]).await,
            Err(AppError::SizeExceeded(_))
        ));
        assert_eq!(h.chunks.len(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_body_shorter_than_content_length_is_rolled_back() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap()
            .upload_id;

        assert!(matches!(
            h.service.append(chunk(&id, owner, 0, 8), &mut &b"abc"[..]).await,
            Err(AppError::InvalidRequest(_))
        ));
        assert_eq!(h.chunks.len(&id).await.unwrap(), 0);
        assert_eq!(h.service.info(&id, owner).await.unwrap().offset, 0);
        assert_eq!(h.metadata.find_by_id(&id).await.unwrap().unwrap().offset, 0);

        let outcome = h
            .service
            .append(chunk(&id, owner, 0, 3), &mut &b"abc"[..])
            .await
            .unwrap();
        assert_eq!(outcome.offset, 3);
    }

    #[tokio::test]
    async fn test_deferred_length() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Deferred))
            .await
            .unwrap()
            .upload_id;
        assert_eq!(h.service.info(&id, owner).await.unwrap().total_size, None);

        h.service
            .append(chunk(&id, owner, 0, 3), &mut &b"abc"[..])
            .await
            .unwrap();

        let mut short = chunk(&id, owner, 3, 0);
        short.declared_length = Some(2);
        assert!(matches!(
            h.service.append(short, &mut &b""[..]).await,
            Err(AppError::InvalidRequest(_))
        ));

        let mut declare = chunk(&id, owner, 3, 2);
        declare.declared_length = Some(6);
        let outcome = h.service.append(declare, &mut &b"de"[..]).await.unwrap();
        assert_eq!(outcome.offset, 5);
        assert_eq!(h.service.info(&id, owner).await.unwrap().total_size, Some(6));

        let mut changed = chunk(&id, owner, 5, 1);
        changed.declared_length = Some(7);
        assert!(matches!(
            h.service.append(changed, &mut &b"f"[..]).await,
            Err(AppError::InvalidRequest(_))
        ));

        let outcome = h
            .service
            .append(chunk(&id, owner, 5, 1), &mut &b"f"[..])
            .await
            .unwrap();
        assert!(outcome.finalized);
    }

    #[tokio::test]
    async fn test_failed_record_update_rolls_back_chunk() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap()
            .upload_id;

        h.metadata.fail_updates.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.service.append(chunk(&id, owner, 0, 4), &mut &b"abcd"[..]).await,
            Err(AppError::Database(_))
        ));
        assert_eq!(h.chunks.len(&id).await.unwrap(), 0);
        assert_eq!(h.service.info(&id, owner).await.unwrap().offset, 0);

        h.metadata.fail_updates.store(false, Ordering::SeqCst);
        let outcome = h
            .service
            .append(chunk(&id, owner, 0, 4), &mut &b"abcd"[..])
            .await
            .unwrap();
        assert_eq!(outcome.offset, 4);
    }

    #[tokio::test]
    async fn test_cancel_releases_everything() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap()
            .upload_id;
        h.service
            .append(chunk(&id, owner, 0, 2), &mut &b"ab"[..])
            .await
            .unwrap();

        assert!(matches!(
            h.service.cancel(&id, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
        h.service.cancel(&id, owner).await.unwrap();

        assert!(h.chunks.len(&id).await.is_err());
        assert!(h.metadata.find_by_id(&id).await.unwrap().is_none());
        assert!(matches!(
            h.service.info(&id, owner).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.service.append(chunk(&id, owner, 2, 1), &mut &b"c"[..]).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.service.cancel(&id, owner).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_waits_for_append_then_times_out() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(10)))
            .await
            .unwrap()
            .upload_id;

        let session = h.service.registry().get(&id).await.unwrap();
        let guard = session.try_lock().unwrap();
        assert!(matches!(
            h.service.cancel(&id, owner).await,
            Err(AppError::Conflict(_))
        ));
        drop(guard);
        h.service.cancel(&id, owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_completed_upload_conflicts() {
        let h = harness(settings()).await;
        let owner = Uuid::new_v4();
        let id = h
            .service
            .create(create_request(owner, UploadLength::Fixed(2)))
            .await
            .unwrap()
            .upload_id;
        h.service
            .append(chunk(&id, owner, 0, 2), &mut &b"ab"[..])
            .await
            .unwrap();

        assert!(matches!(
            h.service.cancel(&id, owner).await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            h.service.cancel(&id, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
