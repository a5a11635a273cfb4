//! Processing queue: bounded channel, fixed worker pool, retry with backoff.
//!
//! Shutdown: [`ProcessingQueue::shutdown`] stops the dispatcher; runs already in
//! flight continue until they finish or time out. A record left in `processing`
//! by a process exit is recovered at the next startup.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;

use tessera_core::models::{ProcessingStatus, UploadRecord, UploadRecordPatch};
use tessera_core::{Config, TaskError};

use crate::context::ProcessingContext;
use crate::task::run_attempt;

/// Upper bound for a single retry delay.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// `base * 2^attempt`, capped at [`MAX_RETRY_BACKOFF`].
#[inline]
pub(crate) fn compute_retry_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

#[derive(Clone, Debug)]
pub struct ProcessingQueueConfig {
    pub max_workers: usize,
    pub queue_size: usize,
    /// Attempts per run, including the first
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub timeout: Duration,
}

impl Default for ProcessingQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_size: 1000,
            max_attempts: 3,
            retry_base: Duration::from_millis(500),
            timeout: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for ProcessingQueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_workers: config.processing_max_workers(),
            queue_size: config.processing_queue_size(),
            max_attempts: config.processing_max_attempts(),
            retry_base: config.processing_retry_base(),
            timeout: config.processing_timeout(),
        }
    }
}

type InflightSet = Arc<Mutex<HashSet<String>>>;

/// Removes an id from the in-flight set when its run ends, however it ends.
struct InflightGuard {
    set: InflightSet,
    upload_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.upload_id);
    }
}

#[derive(Clone)]
pub struct ProcessingQueue {
    tx: mpsc::Sender<String>,
    inflight: InflightSet,
    shutdown_tx: mpsc::Sender<()>,
}

impl ProcessingQueue {
    /// Create the queue and spawn its dispatcher on the current runtime.
    pub fn new(context: ProcessingContext, config: ProcessingQueueConfig) -> Self {
        let queue_size = config.queue_size.max(1);
        let (tx, rx) = mpsc::channel(queue_size);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let inflight: InflightSet = Arc::new(Mutex::new(HashSet::new()));

        tracing::info!(
            queue_size = queue_size,
            max_workers = config.max_workers,
            max_attempts = config.max_attempts,
            "Processing queue initialized with bounded channel"
        );

        let pool_inflight = inflight.clone();
        tokio::spawn(async move {
            Self::worker_pool(rx, shutdown_rx, context, config, pool_inflight).await;
        });

        Self {
            tx,
            inflight,
            shutdown_tx,
        }
    }

    /// Queue `upload_id` for processing without waiting.
    ///
    /// Returns `false` when the id is already queued or running, or when the
    /// queue is full. A full queue leaves the record `pending`; the sweeper
    /// offers it again later.
    pub fn enqueue(&self, upload_id: &str) -> bool {
        {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !inflight.insert(upload_id.to_string()) {
                tracing::debug!(upload_id, "Upload already queued or processing");
                return false;
            }
        }

        match self.tx.try_send(upload_id.to_string()) {
            Ok(()) => {
                tracing::debug!(upload_id, "Upload enqueued for processing");
                true
            }
            Err(e) => {
                self.inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(upload_id);
                match e {
                    mpsc::error::TrySendError::Full(_) => tracing::warn!(
                        upload_id,
                        "Processing queue is full, leaving upload pending"
                    ),
                    mpsc::error::TrySendError::Closed(_) => tracing::error!(
                        upload_id,
                        "Processing queue is closed, leaving upload pending"
                    ),
                }
                false
            }
        }
    }

    /// Whether `upload_id` is queued or being processed by this process.
    pub fn is_inflight(&self, upload_id: &str) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(upload_id)
    }

    async fn worker_pool(
        mut rx: mpsc::Receiver<String>,
        mut shutdown_rx: mpsc::Receiver<()>,
        context: ProcessingContext,
        config: ProcessingQueueConfig,
        inflight: InflightSet,
    ) {
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        tracing::info!(max_workers = config.max_workers, "Processing worker pool started");

        loop {
            let upload_id = tokio::select! {
                _ = shutdown_rx.recv() => break,
                next = rx.recv() => match next {
                    Some(upload_id) => upload_id,
                    None => break,
                },
            };

            let guard = InflightGuard {
                set: inflight.clone(),
                upload_id: upload_id.clone(),
            };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let context = context.clone();
            let config = config.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                process_upload(&context, &config, &upload_id).await;
            });
        }

        tracing::info!("Processing worker pool stopped");
    }

    /// Stop taking new work. Returns without waiting for running tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating processing queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Claim, run with retries and commit the outcome of one upload.
#[tracing::instrument(skip(ctx, config), fields(job.status = tracing::field::Empty))]
pub(crate) async fn process_upload(
    ctx: &ProcessingContext,
    config: &ProcessingQueueConfig,
    upload_id: &str,
) {
    let record = match ctx
        .metadata
        .transition_status(
            upload_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            &UploadRecordPatch::default(),
        )
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::debug!("Upload is not pending, another run owns it");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to claim upload, leaving it pending");
            return;
        }
    };

    let start = std::time::Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let error = match tokio::time::timeout(config.timeout, run_attempt(ctx, &record)).await {
            Ok(Ok(variants)) => match complete(ctx, &record, variants).await {
                Ok(()) => {
                    tracing::Span::current().record("job.status", "completed");
                    tracing::info!(
                        attempts = attempt + 1,
                        duration_ms = start.elapsed().as_millis(),
                        "Upload processing completed"
                    );
                    return;
                }
                Err(e) => e,
            },
            Ok(Err(e)) => e,
            Err(_) => TaskError::recoverable(anyhow::anyhow!(
                "Processing timed out after {}s",
                config.timeout.as_secs()
            )),
        };

        attempt += 1;
        let retry = error.is_recoverable() && attempt < max_attempts;
        tracing::warn!(
            error = %error,
            attempt = attempt,
            max_attempts = max_attempts,
            recoverable = error.is_recoverable(),
            "Processing attempt failed"
        );

        if retry {
            let backoff = compute_retry_backoff(config.retry_base, attempt - 1);
            tracing::info!(backoff_ms = backoff.as_millis(), "Scheduling processing retry");
            sleep(backoff).await;
            continue;
        }

        tracing::Span::current().record("job.status", "failed");
        fail(ctx, &record, &error).await;
        return;
    }
}

async fn complete(
    ctx: &ProcessingContext,
    record: &UploadRecord,
    variants: BTreeMap<String, String>,
) -> Result<(), TaskError> {
    let patch = UploadRecordPatch {
        processed_variants: Some(variants),
        processing_error: Some(None),
        ..Default::default()
    };
    let updated = ctx
        .metadata
        .transition_status(
            &record.upload_id,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            &patch,
        )
        .await?;

    if updated.is_none() {
        tracing::warn!("Upload left processing before completion could be recorded");
    }
    Ok(())
}

async fn fail(ctx: &ProcessingContext, record: &UploadRecord, error: &TaskError) {
    let patch = UploadRecordPatch {
        processing_error: Some(Some(error.to_string())),
        ..Default::default()
    };
    match ctx
        .metadata
        .transition_status(
            &record.upload_id,
            ProcessingStatus::Processing,
            ProcessingStatus::Failed,
            &patch,
        )
        .await
    {
        Ok(_) => tracing::error!(error = %error, "Upload processing failed"),
        Err(e) => tracing::error!(
            error = %error,
            store_error = %e,
            "Upload processing failed and the failure could not be recorded"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tessera_core::models::{FileType, UploadMetadata, Visibility};
    use futures::future::join_all;
    use tessera_core::ThumbnailSize;
    use tessera_db::{InMemoryMetadataStore, MetadataStore};
    use tessera_storage::{LocalStorage, Storage, StorageError, StorageResult};
    use uuid::Uuid;

    fn png_bytes() -> Vec<u8> {
        let mut buffer = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::new(64, 48))
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn fast_config() -> ProcessingQueueConfig {
        ProcessingQueueConfig {
            max_workers: 2,
            queue_size: 8,
            max_attempts: 3,
            retry_base: Duration::from_millis(1),
            timeout: Duration::from_secs(10),
        }
    }

    async fn seed(
        store: &InMemoryMetadataStore,
        storage: &dyn Storage,
        file_type: FileType,
        declared: &str,
        payload: Vec<u8>,
    ) -> String {
        let upload_id = format!("up{}", Uuid::new_v4().simple());
        let metadata = UploadMetadata {
            filetype: Some(declared.to_string()),
            ..Default::default()
        };
        let mut record = UploadRecord::new(
            upload_id.clone(),
            Uuid::new_v4(),
            Some(payload.len() as u64),
            metadata,
            file_type,
            Visibility::Private,
        );
        let key = format!("uploads/test/{}", upload_id);
        storage.put(&key, payload).await.unwrap();
        record.offset = record.total_size.unwrap_or_default();
        record.file = Some(key);
        store.create(&record).await.unwrap();
        upload_id
    }

    async fn wait_for_terminal(store: &InMemoryMetadataStore, upload_id: &str) -> UploadRecord {
        for _ in 0..200 {
            let record = store.find_by_id(upload_id).await.unwrap().unwrap();
            if record.processing_status.is_terminal() {
                return record;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("upload {} never reached a terminal status", upload_id);
    }

    #[test]
    fn retry_backoff_exponential_then_capped() {
        let base = Duration::from_millis(500);
        assert_eq!(compute_retry_backoff(base, 0), Duration::from_millis(500));
        assert_eq!(compute_retry_backoff(base, 1), Duration::from_millis(1000));
        assert_eq!(compute_retry_backoff(base, 3), Duration::from_millis(4000));
        assert_eq!(compute_retry_backoff(base, 10), MAX_RETRY_BACKOFF);
        assert_eq!(compute_retry_backoff(base, 40), MAX_RETRY_BACKOFF);
    }

    #[tokio::test]
    async fn test_image_upload_completes_with_variants() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let storage = Arc::new(
            LocalStorage::new(dir.path(), "http://localhost/files".to_string())
                .await
                .unwrap(),
        );
        let ctx = ProcessingContext::new(
            store.clone(),
            storage.clone(),
            vec![ThumbnailSize::new(100, 100), ThumbnailSize::new(300, 300)],
        );
        let queue = ProcessingQueue::new(ctx, fast_config());

        let upload_id = seed(&store, storage.as_ref(), FileType::Media, "image/png", png_bytes()).await;
        assert!(queue.enqueue(&upload_id));

        let record = wait_for_terminal(&store, &upload_id).await;
        assert_eq!(record.processing_status, ProcessingStatus::Completed);
        assert!(record.processing_error.is_none());
        let names: Vec<&str> = record.processed_variants.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["100x100", "300x300"]);
        for key in record.processed_variants.values() {
            assert!(storage.exists(key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_invalid_content_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let storage = Arc::new(
            LocalStorage::new(dir.path(), "http://localhost/files".to_string())
                .await
                .unwrap(),
        );
        let ctx = ProcessingContext::new(store.clone(), storage.clone(), vec![]);
        let queue = ProcessingQueue::new(ctx, fast_config());

        let upload_id = seed(
            &store,
            storage.as_ref(),
            FileType::Avatar,
            "image/png",
            b"not an image at all".to_vec(),
        )
        .await;
        queue.enqueue(&upload_id);

        let record = wait_for_terminal(&store, &upload_id).await;
        assert_eq!(record.processing_status, ProcessingStatus::Failed);
        assert!(record.processing_error.unwrap().contains("must be images"));
    }

    /// Storage whose reads fail a fixed number of times before delegating.
    struct FlakyStorage {
        inner: LocalStorage,
        failures_left: AtomicU32,
        reads: AtomicU32,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<String> {
            self.inner.put(key, data).await
        }
        async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::ReadFailed("disk hiccup".to_string()));
            }
            self.inner.get(key).await
        }
        async fn ingest(&self, key: &str, source: &Path) -> StorageResult<u64> {
            self.inner.ingest(key, source).await
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }
        async fn content_length(&self, key: &str) -> StorageResult<u64> {
            self.inner.content_length(key).await
        }
        fn url(&self, key: &str) -> String {
            self.inner.url(key)
        }
    }

    async fn flaky(dir: &Path, failures: u32) -> Arc<FlakyStorage> {
        Arc::new(FlakyStorage {
            inner: LocalStorage::new(dir, "http://localhost/files".to_string())
                .await
                .unwrap(),
            failures_left: AtomicU32::new(failures),
            reads: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let storage = flaky(dir.path(), 2).await;
        let ctx = ProcessingContext::new(store.clone(), storage.clone(), vec![]);

        let upload_id = seed(&store, storage.as_ref(), FileType::Temp, "text/plain", b"x".to_vec()).await;
        process_upload(&ctx, &fast_config(), &upload_id).await;

        let record = store.find_by_id(&upload_id).await.unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Completed);
        assert_eq!(storage.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let storage = flaky(dir.path(), 10).await;
        let ctx = ProcessingContext::new(store.clone(), storage.clone(), vec![]);

        let upload_id = seed(&store, storage.as_ref(), FileType::Temp, "text/plain", b"x".to_vec()).await;
        process_upload(&ctx, &fast_config(), &upload_id).await;

        let record = store.find_by_id(&upload_id).await.unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Failed);
        assert!(record.processing_error.unwrap().contains("disk hiccup"));
        assert_eq!(storage.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_runs_process_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryMetadataStore::new());
        let storage = flaky(dir.path(), 0).await;
        let ctx = ProcessingContext::new(store.clone(), storage.clone(), vec![]);
        let upload_id = seed(&store, storage.as_ref(), FileType::Temp, "text/plain", b"x".to_vec()).await;

        let config = fast_config();
        join_all((0..4).map(|_| process_upload(&ctx, &config, &upload_id))).await;

        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);
        let record = store.find_by_id(&upload_id).await.unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_and_respects_capacity() {
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let queue = ProcessingQueue {
            tx,
            inflight: InflightSet::default(),
            shutdown_tx,
        };

        assert!(queue.enqueue("a"));
        assert!(queue.is_inflight("a"));
        assert!(!queue.enqueue("a"));

        // channel holds one item
        assert!(!queue.enqueue("b"));
        assert!(!queue.is_inflight("b"));
    }
}
