use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::batch::models::{BatchJob, BatchJobStatus, BatchProgress};
use crate::batch::repositories::BatchJobRepository;
use dealsync_common::error::{DealSyncError, DealSyncResult};

const COLUMNS: &str = "id, connection_id, status, start_date, end_date, stage_names, batch_size,
    total_records, total_batches, processed_batches, processed_records, created_records,
    updated_records, failed_records, error_message, created_at, started_at, completed_at,
    updated_at";

#[derive(Clone)]
pub struct PgBatchJobRepository {
    pool: PgPool,
}

impl PgBatchJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: sqlx::postgres::PgRow) -> DealSyncResult<BatchJob> {
        let status: String = row.get("status");
        Ok(BatchJob {
            id: row.get("id"),
            connection_id: row.get("connection_id"),
            status: status.parse().map_err(DealSyncError::Database)?,
            start_date: row.get("start_date"),
            end_date: row.get("end_date"),
            stage_names: row.get("stage_names"),
            batch_size: row.get("batch_size"),
            total_records: row.get("total_records"),
            total_batches: row.get("total_batches"),
            processed_batches: row.get("processed_batches"),
            processed_records: row.get("processed_records"),
            created_records: row.get("created_records"),
            updated_records: row.get("updated_records"),
            failed_records: row.get("failed_records"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl BatchJobRepository for PgBatchJobRepository {
    async fn create(&self, job: BatchJob) -> DealSyncResult<BatchJob> {
        let row = sqlx::query(&format!(
            "insert into batch_jobs
             (id, connection_id, status, start_date, end_date, stage_names, batch_size,
              total_records, total_batches, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
             returning {COLUMNS}"
        ))
        .bind(job.id)
        .bind(job.connection_id)
        .bind(job.status.as_str())
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(&job.stage_names)
        .bind(job.batch_size)
        .bind(job.total_records)
        .bind(job.total_batches)
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn get(&self, id: Uuid) -> DealSyncResult<Option<BatchJob>> {
        let row = sqlx::query(&format!("select {COLUMNS} from batch_jobs where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn list_by_connection(
        &self,
        connection_id: Uuid,
        limit: i64,
    ) -> DealSyncResult<Vec<BatchJob>> {
        let rows = sqlx::query(&format!(
            "select {COLUMNS} from batch_jobs
             where connection_id = $1
             order by created_at desc
             limit $2"
        ))
        .bind(connection_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BatchJobStatus],
        to: BatchJobStatus,
        error_message: Option<&str>,
    ) -> DealSyncResult<Option<BatchJob>> {
        let from: Vec<&str> = from.iter().map(BatchJobStatus::as_str).collect();
        let row = sqlx::query(&format!(
            "update batch_jobs set
               status = $3,
               error_message = $4,
               started_at = case when $3 = 'running' then $5 else started_at end,
               completed_at = case
                 when $3 in ('completed', 'failed', 'cancelled') then $5
                 else completed_at
               end,
               updated_at = $5
             where id = $1 and status = any($2)
             returning {COLUMNS}"
        ))
        .bind(id)
        .bind(&from)
        .bind(to.as_str())
        .bind(error_message)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn record_progress(&self, id: Uuid, progress: BatchProgress) -> DealSyncResult<BatchJob> {
        let row = sqlx::query(&format!(
            "update batch_jobs set
               processed_batches = processed_batches + 1,
               processed_records = processed_records + $2,
               created_records = created_records + $3,
               updated_records = updated_records + $4,
               failed_records = failed_records + $5,
               updated_at = now()
             where id = $1
             returning {COLUMNS}"
        ))
        .bind(id)
        .bind(progress.records)
        .bind(progress.created)
        .bind(progress.updated)
        .bind(progress.failed)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        match row {
            Some(r) => Self::map_row(r),
            None => Err(DealSyncError::NotFound(format!("batch job {id}"))),
        }
    }

    async fn reset_for_retry(&self, id: Uuid) -> DealSyncResult<Option<BatchJob>> {
        let row = sqlx::query(&format!(
            "update batch_jobs set
               status = 'pending',
               error_message = null,
               processed_batches = 0,
               processed_records = 0,
               created_records = 0,
               updated_records = 0,
               failed_records = 0,
               started_at = null,
               completed_at = null,
               updated_at = now()
             where id = $1 and status = 'failed'
             returning {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }
}
