use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::leases::models::{TaskLease, TaskType};
use crate::leases::repositories::TaskLeaseRepository;
use dealsync_common::error::{DealSyncError, DealSyncResult};

#[derive(Clone)]
pub struct PgTaskLeaseRepository {
    pool: PgPool,
}

impl PgTaskLeaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: sqlx::postgres::PgRow) -> DealSyncResult<TaskLease> {
        let task_type: String = row.get("task_type");
        Ok(TaskLease {
            id: row.get("id"),
            connection_id: row.get("connection_id"),
            task_type: task_type.parse().map_err(DealSyncError::Database)?,
            acquired_at: row.get("acquired_at"),
            expires_at: row.get("expires_at"),
        })
    }
}

#[async_trait]
impl TaskLeaseRepository for PgTaskLeaseRepository {
    async fn try_acquire(
        &self,
        connection_id: Uuid,
        task_type: TaskType,
        ttl: Duration,
    ) -> DealSyncResult<Option<TaskLease>> {
        let now = Utc::now();
        let row = sqlx::query(
            "insert into task_leases (id, connection_id, task_type, acquired_at, expires_at)
             values ($1, $2, $3, $4, $5)
             on conflict (connection_id) do update set
               id = excluded.id,
               task_type = excluded.task_type,
               acquired_at = excluded.acquired_at,
               expires_at = excluded.expires_at
             where task_leases.expires_at <= excluded.acquired_at
             returning id, connection_id, task_type, acquired_at, expires_at",
        )
        .bind(Uuid::new_v4())
        .bind(connection_id)
        .bind(task_type.as_str())
        .bind(now)
        .bind(now + ttl)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn renew(&self, lease_id: Uuid, ttl: Duration) -> DealSyncResult<bool> {
        let result = sqlx::query("update task_leases set expires_at = $2 where id = $1")
            .bind(lease_id)
            .bind(Utc::now() + ttl)
            .execute(&self.pool)
            .await
            .map_err(|e| DealSyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, lease_id: Uuid) -> DealSyncResult<()> {
        sqlx::query("delete from task_leases where id = $1")
            .bind(lease_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DealSyncError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_active(&self, connection_id: Uuid) -> DealSyncResult<Option<TaskLease>> {
        let row = sqlx::query(
            "select id, connection_id, task_type, acquired_at, expires_at
             from task_leases
             where connection_id = $1 and expires_at > now()",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }
}
