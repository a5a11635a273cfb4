//! Periodic cleanup of expired sessions, orphaned chunks and stalled processing

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tessera_core::models::ProcessingStatus;
use tessera_core::AppError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::protocol::TusService;
use super::registry::SessionEnd;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions idle past the TTL, removed with their chunk and record
    pub expired: usize,
    /// Staged chunks with no session, discarded
    pub orphans: usize,
    /// Complete sessions whose finalize had failed, finalized now
    pub finalized: usize,
    /// Finalized `pending` records offered to the processing queue again
    pub requeued: usize,
}

impl TusService {
    /// One sweep pass. Busy sessions are skipped and picked up next time.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let start = Instant::now();
        let mut report = SweepReport::default();

        self.sweep_sessions(&mut report).await;
        self.sweep_orphans(&mut report).await?;
        self.requeue_pending(&mut report).await?;

        tracing::debug!(
            expired = report.expired,
            orphans = report.orphans,
            finalized = report.finalized,
            requeued = report.requeued,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Sweep finished"
        );
        Ok(report)
    }

    async fn sweep_sessions(&self, report: &mut SweepReport) {
        let now = Utc::now();

        for session in self.registry.sessions().await {
            let Ok(_guard) = session.try_lock() else {
                continue;
            };
            let state = session.snapshot().await;
            if state.ended.is_some() {
                continue;
            }
            let upload_id = session.upload_id();

            if state.record.is_upload_complete() {
                match self.finalize(&session).await {
                    Ok(()) => report.finalized += 1,
                    Err(e) => tracing::warn!(
                        upload_id = %upload_id,
                        error = %e,
                        "Finalize retry failed"
                    ),
                }
                continue;
            }

            if !self.is_expired(state.record.last_activity_at, now) {
                continue;
            }

            if let Err(e) = self.metadata.delete(upload_id).await {
                tracing::warn!(upload_id = %upload_id, error = %e, "Failed to delete expired record");
                continue;
            }
            if let Err(e) = self.chunks.discard(upload_id).await {
                tracing::warn!(upload_id = %upload_id, error = %e, "Failed to discard expired chunk");
            }
            session.end(SessionEnd::Expired).await;
            self.registry.remove(upload_id).await;
            report.expired += 1;

            tracing::info!(
                upload_id = %upload_id,
                offset = state.record.offset,
                last_activity_at = %state.record.last_activity_at,
                "Expired upload removed"
            );
        }
    }

    async fn sweep_orphans(&self, report: &mut SweepReport) -> Result<(), AppError> {
        // Sessions are registered before their chunk is created, so a listed
        // chunk without a session is never one being set up.
        for upload_id in self.chunks.list().await? {
            if self.registry.contains(&upload_id).await {
                continue;
            }
            match self.chunks.discard(&upload_id).await {
                Ok(()) => {
                    report.orphans += 1;
                    tracing::info!(upload_id = %upload_id, "Orphaned chunk discarded");
                }
                Err(e) => {
                    tracing::warn!(upload_id = %upload_id, error = %e, "Failed to discard orphaned chunk")
                }
            }
        }
        Ok(())
    }

    async fn requeue_pending(&self, report: &mut SweepReport) -> Result<(), AppError> {
        for record in self.metadata.list_unfinished().await? {
            if record.processing_status != ProcessingStatus::Pending || !record.is_finalized() {
                continue;
            }
            if self.queue.is_inflight(&record.upload_id) {
                continue;
            }
            if self.queue.enqueue(&record.upload_id) {
                report.requeued += 1;
            }
        }
        Ok(())
    }
}

/// Run [`TusService::sweep`] every `interval` until the runtime shuts down.
pub fn spawn_sweeper(service: Arc<TusService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; restore already ran at startup.
        ticker.tick().await;

        tracing::info!(interval_secs = interval.as_secs(), "Upload sweeper started");
        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep().await {
                tracing::error!(error = %e, "Sweep failed");
            }
        }
    })
}
