//! Per-connection task serialization on top of the persisted lease table.

use std::time::Duration;

use uuid::Uuid;

use dealsync_common::error::{DealSyncError, DealSyncResult};
use dealsync_db::leases::models::{TaskLease, TaskType};
use dealsync_db::leases::repositories::TaskLeaseRepository;

pub(crate) fn ttl(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Take the connection's lease or fail with `Conflict` naming the active task.
pub async fn acquire(
    leases: &dyn TaskLeaseRepository,
    connection_id: Uuid,
    task_type: TaskType,
    lease_ttl: Duration,
) -> DealSyncResult<TaskLease> {
    if let Some(lease) = leases
        .try_acquire(connection_id, task_type, ttl(lease_ttl))
        .await?
    {
        tracing::debug!(%connection_id, task = task_type.as_str(), lease_id = %lease.id, "lease acquired");
        return Ok(lease);
    }

    let active = leases
        .get_active(connection_id)
        .await
        .ok()
        .flatten()
        .map(|l| l.task_type.as_str())
        .unwrap_or("another task");
    Err(DealSyncError::Conflict(format!(
        "connection {connection_id} is busy: {active} in progress"
    )))
}

/// Push the lease's expiry out by another TTL; `Conflict` once it was lost.
pub async fn renew(
    leases: &dyn TaskLeaseRepository,
    lease: &TaskLease,
    lease_ttl: Duration,
) -> DealSyncResult<()> {
    if leases.renew(lease.id, ttl(lease_ttl)).await? {
        return Ok(());
    }
    Err(DealSyncError::Conflict(format!(
        "lease for connection {} was lost",
        lease.connection_id
    )))
}

/// Release a lease; failures only log, the lease then lapses at its expiry.
pub async fn release(leases: &dyn TaskLeaseRepository, lease: &TaskLease) {
    if let Err(e) = leases.release(lease.id).await {
        tracing::warn!(
            connection_id = %lease.connection_id,
            lease_id = %lease.id,
            error = %e,
            "failed to release lease"
        );
    }
}
