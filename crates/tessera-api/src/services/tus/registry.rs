//! In-memory index of in-flight upload sessions.
//!
//! The registry owns one [`UploadSession`] per incomplete upload. A session
//! carries the per-id lock taken by append, cancel, finalize and the sweeper,
//! and a snapshot of the record behind a read/write lock so that status
//! queries never wait on an append in progress.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use lru::LruCache;
use rand::rngs::OsRng;
use rand::TryRngCore;
use tessera_core::constants::UPLOAD_ID_BYTES;
use tessera_core::models::UploadRecord;
use tessera_core::AppError;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, RwLock, TryLockError};
use uuid::Uuid;

/// Why a session left the registry while someone was waiting on its lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Finalized,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub record: UploadRecord,
    /// Set once the session reached a terminal state; the entry is about to be dropped.
    pub ended: Option<SessionEnd>,
}

pub struct UploadSession {
    upload_id: String,
    owner: Uuid,
    lock: AsyncMutex<()>,
    state: RwLock<SessionState>,
}

impl UploadSession {
    fn new(record: UploadRecord) -> Self {
        Self {
            upload_id: record.upload_id.clone(),
            owner: record.owner,
            lock: AsyncMutex::new(()),
            state: RwLock::new(SessionState {
                record,
                ended: None,
            }),
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Take the per-id lock without waiting.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, ()>, TryLockError> {
        self.lock.try_lock()
    }

    /// Take the per-id lock, waiting for the current holder.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Current snapshot. Never blocks on the per-id lock.
    pub async fn snapshot(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn last_activity_at(&self) -> DateTime<Utc> {
        self.state.read().await.record.last_activity_at
    }

    /// Replace the record. Callers hold the per-id lock.
    pub async fn set_record(&self, record: UploadRecord) {
        self.state.write().await.record = record;
    }

    /// Mark terminal. Callers hold the per-id lock.
    pub async fn end(&self, end: SessionEnd) {
        self.state.write().await.ended = Some(end);
    }
}

/// Explicit manager of in-flight sessions and their locks.
pub struct UploadRegistry {
    sessions: RwLock<HashMap<String, Arc<UploadSession>>>,
    /// Recently cancelled ids and their owners
    cancelled: Mutex<LruCache<String, Uuid>>,
}

impl UploadRegistry {
    pub fn new(cancelled_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cancelled_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: RwLock::new(HashMap::new()),
            cancelled: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fresh id: URL-safe base64 of bytes drawn from the OS CSPRNG.
    pub fn generate_id() -> Result<String, AppError> {
        let mut bytes = [0u8; UPLOAD_ID_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AppError::Internal(format!("OS random source failed: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Register a session for `record`. Fails with `Conflict` if the id is live.
    pub async fn insert(&self, record: UploadRecord) -> Result<Arc<UploadSession>, AppError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&record.upload_id) {
            return Err(AppError::Conflict(format!(
                "Upload {} already exists",
                record.upload_id
            )));
        }
        let session = Arc::new(UploadSession::new(record));
        sessions.insert(session.upload_id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, upload_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.read().await.get(upload_id).cloned()
    }

    pub async fn contains(&self, upload_id: &str) -> bool {
        self.sessions.read().await.contains_key(upload_id)
    }

    /// Drop the entry and with it the per-id lock.
    pub async fn remove(&self, upload_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.write().await.remove(upload_id)
    }

    pub async fn sessions(&self) -> Vec<Arc<UploadSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub fn remember_cancelled(&self, upload_id: &str, owner: Uuid) {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(upload_id.to_string(), owner);
    }

    /// Owner of a recently cancelled id
    pub fn cancelled_owner(&self, upload_id: &str) -> Option<Uuid> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(upload_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::models::{FileType, UploadMetadata, Visibility};

    fn record(id: &str) -> UploadRecord {
        UploadRecord::new(
            id.to_string(),
            Uuid::new_v4(),
            Some(10),
            UploadMetadata::default(),
            FileType::Media,
            Visibility::Private,
        )
    }

    #[test]
    fn test_generated_ids_are_url_safe_and_unique() {
        let a = UploadRegistry::generate_id().unwrap();
        let b = UploadRegistry::generate_id().unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = UploadRegistry::new(16);
        registry.insert(record("a")).await.unwrap();
        assert!(matches!(
            registry.insert(record("a")).await,
            Err(AppError::Conflict(_))
        ));
        assert!(registry.contains("a").await);
        assert!(registry.get("A").await.is_none());
        assert!(registry.remove("a").await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_snapshot_does_not_wait() {
        let registry = UploadRegistry::new(16);
        let session = registry.insert(record("a")).await.unwrap();

        let guard = session.try_lock().unwrap();
        assert!(session.try_lock().is_err());
        assert_eq!(session.snapshot().await.record.offset, 0);
        drop(guard);
        assert!(session.try_lock().is_ok());
    }

    #[test]
    fn test_cancelled_memory_is_bounded() {
        let registry = UploadRegistry::new(2);
        let owner = Uuid::new_v4();
        registry.remember_cancelled("a", owner);
        registry.remember_cancelled("b", owner);
        registry.remember_cancelled("c", owner);
        assert_eq!(registry.cancelled_owner("a"), None);
        assert_eq!(registry.cancelled_owner("c"), Some(owner));
    }
}
