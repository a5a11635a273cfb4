use std::collections::HashMap;

use async_trait::async_trait;
use tessera_core::models::{ProcessingStatus, UploadRecord, UploadRecordPatch};
use tessera_core::AppError;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::metadata_store::{check_transition, MetadataStore};

/// Process-local [`MetadataStore`] for development and tests.
///
/// Records do not survive a restart.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, UploadRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, record: &UploadRecord) -> Result<(), AppError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.upload_id) {
            return Err(AppError::Conflict(format!(
                "Upload {} already exists",
                record.upload_id
            )));
        }
        records.insert(record.upload_id.clone(), record.clone());
        Ok(())
    }

    async fn update(
        &self,
        upload_id: &str,
        patch: &UploadRecordPatch,
    ) -> Result<UploadRecord, AppError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(upload_id)
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))?;
        patch.apply(record);
        Ok(record.clone())
    }

    async fn delete(&self, upload_id: &str) -> Result<bool, AppError> {
        Ok(self.records.write().await.remove(upload_id).is_some())
    }

    async fn find_by_id(&self, upload_id: &str) -> Result<Option<UploadRecord>, AppError> {
        Ok(self.records.read().await.get(upload_id).cloned())
    }

    async fn transition_status(
        &self,
        upload_id: &str,
        from: ProcessingStatus,
        to: ProcessingStatus,
        patch: &UploadRecordPatch,
    ) -> Result<Option<UploadRecord>, AppError> {
        check_transition(from, to)?;

        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(upload_id) else {
            return Ok(None);
        };
        if record.processing_status != from {
            return Ok(None);
        }
        patch.apply(record);
        record.processing_status = to;
        Ok(Some(record.clone()))
    }

    async fn list_by_owner(&self, owner: Uuid) -> Result<Vec<UploadRecord>, AppError> {
        let mut records: Vec<UploadRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn list_unfinished(&self) -> Result<Vec<UploadRecord>, AppError> {
        let mut records: Vec<UploadRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.processing_status.is_terminal())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_core::models::{FileType, UploadMetadata, Visibility};

    fn record(id: &str, owner: Uuid) -> UploadRecord {
        UploadRecord::new(
            id.to_string(),
            owner,
            Some(100),
            UploadMetadata::default(),
            FileType::Media,
            Visibility::Private,
        )
    }

    #[tokio::test]
    async fn test_create_find_delete() {
        let store = InMemoryMetadataStore::new();
        let owner = Uuid::new_v4();
        store.create(&record("a", owner)).await.unwrap();

        assert!(matches!(
            store.create(&record("a", owner)).await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(store.find_by_id("a").await.unwrap().unwrap().owner, owner);
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.find_by_id("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = InMemoryMetadataStore::new();
        let patch = UploadRecordPatch::progress(5, chrono::Utc::now());
        assert!(matches!(
            store.update("nope", &patch).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let store = InMemoryMetadataStore::new();
        store.create(&record("a", Uuid::new_v4())).await.unwrap();
        let empty = UploadRecordPatch::default();

        let claimed = store
            .transition_status("a", ProcessingStatus::Pending, ProcessingStatus::Processing, &empty)
            .await
            .unwrap();
        assert_eq!(claimed.unwrap().processing_status, ProcessingStatus::Processing);

        let again = store
            .transition_status("a", ProcessingStatus::Pending, ProcessingStatus::Processing, &empty)
            .await
            .unwrap();
        assert!(again.is_none());

        let illegal = store
            .transition_status("a", ProcessingStatus::Processing, ProcessingStatus::Pending, &empty)
            .await;
        assert!(illegal.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.create(&record("a", Uuid::new_v4())).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition_status(
                        "a",
                        ProcessingStatus::Pending,
                        ProcessingStatus::Processing,
                        &UploadRecordPatch::default(),
                    )
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_listing() {
        let store = InMemoryMetadataStore::new();
        let owner = Uuid::new_v4();
        store.create(&record("a", owner)).await.unwrap();
        store.create(&record("b", owner)).await.unwrap();
        store.create(&record("c", Uuid::new_v4())).await.unwrap();
        store
            .update("b", &UploadRecordPatch::status(ProcessingStatus::Completed))
            .await
            .unwrap();

        assert_eq!(store.list_by_owner(owner).await.unwrap().len(), 2);
        let unfinished: Vec<String> = store
            .list_unfinished()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.upload_id)
            .collect();
        assert_eq!(unfinished.len(), 2);
        assert!(!unfinished.contains(&"b".to_string()));
    }
}
