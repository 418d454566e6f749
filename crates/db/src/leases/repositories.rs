use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::leases::models::{TaskLease, TaskType};
use dealsync_common::error::DealSyncResult;

#[async_trait]
pub trait TaskLeaseRepository: Send + Sync {
    /// Conditionally take the connection's lease.
    /// Returns `None` if an unexpired lease is held by someone else.
    async fn try_acquire(
        &self,
        connection_id: Uuid,
        task_type: TaskType,
        ttl: Duration,
    ) -> DealSyncResult<Option<TaskLease>>;

    /// Push out the expiry of a lease still held. Returns `false` if it was lost.
    async fn renew(&self, lease_id: Uuid, ttl: Duration) -> DealSyncResult<bool>;

    async fn release(&self, lease_id: Uuid) -> DealSyncResult<()>;

    async fn get_active(&self, connection_id: Uuid) -> DealSyncResult<Option<TaskLease>>;
}
