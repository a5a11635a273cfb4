use async_trait::async_trait;
use tessera_core::models::{ProcessingStatus, UploadRecord, UploadRecordPatch};
use tessera_core::AppError;
use uuid::Uuid;

/// Durable home of `file_uploads` records.
///
/// Every call may fail with a transient `AppError::Database`/`AppError::Storage`;
/// callers treat those as retryable and never assume an update landed.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id is taken.
    async fn create(&self, record: &UploadRecord) -> Result<(), AppError>;

    /// Apply `patch` and return the updated record. Fails with `NotFound` for unknown ids.
    async fn update(&self, upload_id: &str, patch: &UploadRecordPatch)
        -> Result<UploadRecord, AppError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, upload_id: &str) -> Result<bool, AppError>;

    async fn find_by_id(&self, upload_id: &str) -> Result<Option<UploadRecord>, AppError>;

    /// Compare-and-set on `processing_status`.
    ///
    /// Moves the record from `from` to `to` and applies `patch` in the same write,
    /// only if its current status is `from`. Returns `None` when the guard did not
    /// match (another worker won, or the record is gone).
    async fn transition_status(
        &self,
        upload_id: &str,
        from: ProcessingStatus,
        to: ProcessingStatus,
        patch: &UploadRecordPatch,
    ) -> Result<Option<UploadRecord>, AppError>;

    /// Records owned by `owner`, newest first.
    async fn list_by_owner(&self, owner: Uuid) -> Result<Vec<UploadRecord>, AppError>;

    /// Records still `pending` or `processing`: in-flight uploads and finalized
    /// uploads whose processing has not finished.
    async fn list_unfinished(&self) -> Result<Vec<UploadRecord>, AppError>;

    /// Cheap reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), AppError>;
}

/// Reject transitions the state machine does not allow.
pub(crate) fn check_transition(
    from: ProcessingStatus,
    to: ProcessingStatus,
) -> Result<(), AppError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(AppError::Internal(format!(
            "Illegal processing status transition {} -> {}",
            from, to
        )))
    }
}
