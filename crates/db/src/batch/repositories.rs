use async_trait::async_trait;
use uuid::Uuid;

use crate::batch::models::{BatchJob, BatchJobStatus, BatchProgress};
use dealsync_common::error::DealSyncResult;

#[async_trait]
pub trait BatchJobRepository: Send + Sync {
    async fn create(&self, job: BatchJob) -> DealSyncResult<BatchJob>;

    async fn get(&self, id: Uuid) -> DealSyncResult<Option<BatchJob>>;

    async fn list_by_connection(&self, connection_id: Uuid, limit: i64)
        -> DealSyncResult<Vec<BatchJob>>;

    /// Move a job to `to` only if its current status is one of `from`.
    /// Sets `started_at` on entering running and `completed_at` on entering a
    /// terminal state. Returns `None` when the guard did not match.
    async fn transition(
        &self,
        id: Uuid,
        from: &[BatchJobStatus],
        to: BatchJobStatus,
        error_message: Option<&str>,
    ) -> DealSyncResult<Option<BatchJob>>;

    /// Add one batch worth of counters without touching the status.
    async fn record_progress(&self, id: Uuid, progress: BatchProgress) -> DealSyncResult<BatchJob>;

    /// Reset a failed job to pending with cleared error and counters.
    async fn reset_for_retry(&self, id: Uuid) -> DealSyncResult<Option<BatchJob>>;
}
