//! Startup reconciliation of the registry with durable state

use tessera_core::models::{ProcessingStatus, UploadRecord, UploadRecordPatch};
use tessera_core::AppError;
use tessera_storage::StorageError;

use super::protocol::TusService;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// In-flight uploads whose sessions were rebuilt
    pub resumed: usize,
    /// Finalized uploads handed back to the processing queue
    pub requeued: usize,
    /// Runs interrupted mid-processing, now marked failed
    pub interrupted: usize,
    /// Records whose staged bytes were lost, removed
    pub dropped: usize,
}

impl TusService {
    /// Rebuild sessions for every unfinished record.
    ///
    /// Runs once at startup, before the listener accepts requests. The chunk
    /// store is the source of truth for how many bytes survived: the record's
    /// offset is moved to match the staged length.
    pub async fn restore(&self) -> Result<RestoreReport, AppError> {
        let mut report = RestoreReport::default();

        for record in self.metadata.list_unfinished().await? {
            let upload_id = record.upload_id.clone();
            let outcome = match (record.processing_status, record.is_finalized()) {
                (ProcessingStatus::Processing, _) => {
                    let failed = self.fail_interrupted(&upload_id).await;
                    if failed.is_ok() {
                        report.interrupted += 1;
                    }
                    failed
                }
                (ProcessingStatus::Pending, true) => {
                    self.queue.enqueue(&upload_id);
                    report.requeued += 1;
                    Ok(())
                }
                (ProcessingStatus::Pending, false) => self.resume(record, &mut report).await,
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                tracing::error!(upload_id = %upload_id, error = %e, "Failed to restore upload");
            }
        }

        tracing::info!(
            resumed = report.resumed,
            requeued = report.requeued,
            interrupted = report.interrupted,
            dropped = report.dropped,
            "Upload sessions restored"
        );
        Ok(report)
    }

    async fn fail_interrupted(&self, upload_id: &str) -> Result<(), AppError> {
        let patch = UploadRecordPatch {
            processing_error: Some(Some(
                "Processing was interrupted by a restart".to_string(),
            )),
            ..Default::default()
        };
        self.metadata
            .transition_status(
                upload_id,
                ProcessingStatus::Processing,
                ProcessingStatus::Failed,
                &patch,
            )
            .await?;
        tracing::warn!(upload_id = %upload_id, "Interrupted processing marked failed");
        Ok(())
    }

    async fn resume(
        &self,
        mut record: UploadRecord,
        report: &mut RestoreReport,
    ) -> Result<(), AppError> {
        let upload_id = record.upload_id.clone();

        let staged = match self.chunks.len(&upload_id).await {
            Ok(len) => Some(len),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        match staged {
            None if record.offset == 0 => {
                self.chunks.create(&upload_id).await?;
            }
            None => {
                tracing::warn!(
                    upload_id = %upload_id,
                    offset = record.offset,
                    "Staged bytes are gone, dropping upload"
                );
                self.metadata.delete(&upload_id).await?;
                report.dropped += 1;
                return Ok(());
            }
            Some(len) if len > record.offset => {
                self.chunks.truncate(&upload_id, record.offset).await?;
            }
            Some(len) if len < record.offset => {
                tracing::warn!(
                    upload_id = %upload_id,
                    recorded = record.offset,
                    staged = len,
                    "Record ahead of staged bytes, rewinding offset"
                );
                let patch = UploadRecordPatch {
                    offset: Some(len),
                    ..Default::default()
                };
                record = self.metadata.update(&upload_id, &patch).await?;
            }
            Some(_) => {}
        }

        let complete = record.is_upload_complete();
        let session = self.registry.insert(record).await?;
        report.resumed += 1;

        if complete {
            let _guard = session.lock().await;
            self.finalize(&session).await?;
        }
        Ok(())
    }
}
