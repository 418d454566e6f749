use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dealsync_common::error::{DealSyncError, DealSyncResult};
use dealsync_config::SyncSettings;
use dealsync_db::batch::models::{BatchJob, BatchJobStatus, BatchProgress};
use dealsync_db::batch::repositories::BatchJobRepository;
use dealsync_db::connections::models::Connection;
use dealsync_db::connections::repositories::ConnectionRepository;
use dealsync_db::leases::models::{TaskLease, TaskType};
use dealsync_db::leases::repositories::TaskLeaseRepository;

use crate::crm::models::{external_id_of, OpportunityQuery};
use crate::crm::{CrmClient, CrmClientFactory};
use crate::lease;
use crate::manager::SyncManager;
use crate::service::load_active_connection;

// Observed throughput of the upsert path plus per-page CRM round trip.
const SECS_PER_RECORD: f64 = 0.05;
const SECS_PER_BATCH: f64 = 1.5;

/// Window and shape of a historical import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stage_names: Vec<String>,
    /// Falls back to the connection's, then the global batch size.
    #[serde(default)]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEstimate {
    pub total_records: u64,
    pub batch_size: u32,
    pub total_batches: u64,
    pub estimated_duration_secs: u64,
}

pub fn total_batches(total_records: u64, batch_size: u32) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    total_records.div_ceil(u64::from(batch_size))
}

pub fn estimate_duration_secs(total_records: u64, total_batches: u64) -> u64 {
    (total_records as f64 * SECS_PER_RECORD + total_batches as f64 * SECS_PER_BATCH).ceil() as u64
}

/// Runs backfills as persisted, pollable jobs, one page of records per batch.
pub struct BatchOrchestrator {
    connections: Arc<dyn ConnectionRepository>,
    jobs: Arc<dyn BatchJobRepository>,
    leases: Arc<dyn TaskLeaseRepository>,
    crm: Arc<dyn CrmClientFactory>,
    manager: Arc<SyncManager>,
    settings: SyncSettings,
}

impl BatchOrchestrator {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        jobs: Arc<dyn BatchJobRepository>,
        leases: Arc<dyn TaskLeaseRepository>,
        crm: Arc<dyn CrmClientFactory>,
        manager: Arc<SyncManager>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            connections,
            jobs,
            leases,
            crm,
            manager,
            settings,
        }
    }

    pub async fn estimate(
        &self,
        connection_id: Uuid,
        request: &BatchRequest,
    ) -> DealSyncResult<BatchEstimate> {
        validate_request(request)?;
        let connection = load_active_connection(self.connections.as_ref(), connection_id).await?;
        let crm = self.crm.client_for(&connection)?;
        self.estimate_with(&connection, crm.as_ref(), request).await
    }

    /// Create a pending job under the connection's lease and run it in the background.
    pub async fn start(
        self: &Arc<Self>,
        connection_id: Uuid,
        request: BatchRequest,
    ) -> DealSyncResult<BatchJob> {
        let (job, lease) = self.prepare(connection_id, &request).await?;
        self.spawn_run(job.id, lease);
        Ok(job)
    }

    /// Take the lease and persist a pending job. The caller owns the lease.
    pub async fn prepare(
        &self,
        connection_id: Uuid,
        request: &BatchRequest,
    ) -> DealSyncResult<(BatchJob, TaskLease)> {
        validate_request(request)?;
        let connection = load_active_connection(self.connections.as_ref(), connection_id).await?;
        let lease = lease::acquire(
            self.leases.as_ref(),
            connection_id,
            TaskType::BatchImport,
            self.settings.lease_ttl(),
        )
        .await?;

        match self.create_job(&connection, request).await {
            Ok(job) => {
                tracing::info!(
                    %connection_id,
                    job_id = %job.id,
                    total_records = job.total_records,
                    total_batches = job.total_batches,
                    "batch job created"
                );
                Ok((job, lease))
            }
            Err(e) => {
                lease::release(self.leases.as_ref(), &lease).await;
                Err(e)
            }
        }
    }

    /// Execute a pending job to a terminal state, then release the lease.
    ///
    /// Failures inside the run mark the job failed and are reported through the
    /// returned job rather than as an error.
    pub async fn run(&self, job_id: Uuid, lease: TaskLease) -> DealSyncResult<BatchJob> {
        let outcome = self.execute(job_id, &lease).await;
        lease::release(self.leases.as_ref(), &lease).await;

        let err = match outcome {
            Ok(job) => return Ok(job),
            Err(e) => e,
        };
        tracing::error!(%job_id, kind = err.kind().as_str(), error = %err, "batch import failed");

        let message = err.to_string();
        match self
            .jobs
            .transition(
                job_id,
                &[BatchJobStatus::Pending, BatchJobStatus::Running],
                BatchJobStatus::Failed,
                Some(&message),
            )
            .await?
        {
            Some(job) => {
                self.record_stats(job.connection_id, job.failed_records.max(1) as usize)
                    .await;
                Ok(job)
            }
            None => self.require_job(job_id).await,
        }
    }

    /// Cancel a pending or running job. Running jobs stop before their next batch.
    pub async fn cancel(&self, job_id: Uuid) -> DealSyncResult<BatchJob> {
        if let Some(job) = self
            .jobs
            .transition(
                job_id,
                &[BatchJobStatus::Pending, BatchJobStatus::Running],
                BatchJobStatus::Cancelled,
                None,
            )
            .await?
        {
            tracing::info!(%job_id, processed_batches = job.processed_batches, "batch job cancelled");
            return Ok(job);
        }

        let job = self.require_job(job_id).await?;
        Err(DealSyncError::Conflict(format!(
            "job {job_id} is already {}",
            job.status.as_str()
        )))
    }

    /// Reset a failed job and run its whole window again.
    pub async fn retry(self: &Arc<Self>, job_id: Uuid) -> DealSyncResult<BatchJob> {
        let job = self.require_job(job_id).await?;
        if job.status != BatchJobStatus::Failed {
            return Err(DealSyncError::Conflict(format!(
                "only failed jobs can be retried, job {job_id} is {}",
                job.status.as_str()
            )));
        }
        load_active_connection(self.connections.as_ref(), job.connection_id).await?;
        let lease = lease::acquire(
            self.leases.as_ref(),
            job.connection_id,
            TaskType::BatchImport,
            self.settings.lease_ttl(),
        )
        .await?;

        let reset = match self.jobs.reset_for_retry(job_id).await {
            Ok(Some(reset)) => reset,
            Ok(None) => {
                lease::release(self.leases.as_ref(), &lease).await;
                return Err(DealSyncError::Conflict(format!("job {job_id} is no longer failed")));
            }
            Err(e) => {
                lease::release(self.leases.as_ref(), &lease).await;
                return Err(e);
            }
        };

        tracing::info!(%job_id, connection_id = %reset.connection_id, "retrying batch job");
        self.spawn_run(job_id, lease);
        Ok(reset)
    }

    pub async fn status(&self, job_id: Uuid) -> DealSyncResult<BatchJob> {
        self.require_job(job_id).await
    }

    pub async fn recent_jobs(&self, connection_id: Uuid, limit: i64) -> DealSyncResult<Vec<BatchJob>> {
        self.jobs.list_by_connection(connection_id, limit).await
    }

    fn spawn_run(self: &Arc<Self>, job_id: Uuid, lease: TaskLease) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.run(job_id, lease).await {
                Ok(job) => tracing::info!(%job_id, status = job.status.as_str(), "batch job finished"),
                Err(e) => tracing::error!(%job_id, error = %e, "batch job could not be finalized"),
            }
        });
    }

    async fn execute(&self, job_id: Uuid, lease: &TaskLease) -> DealSyncResult<BatchJob> {
        let Some(job) = self
            .jobs
            .transition(job_id, &[BatchJobStatus::Pending], BatchJobStatus::Running, None)
            .await?
        else {
            let job = self.require_job(job_id).await?;
            tracing::info!(%job_id, status = job.status.as_str(), "batch job no longer pending");
            return Ok(job);
        };

        let connection = self
            .connections
            .get(job.connection_id)
            .await?
            .ok_or_else(|| DealSyncError::NotFound(format!("connection {}", job.connection_id)))?;
        let crm = self.crm.client_for(&connection)?;
        let batch_size = u32::try_from(job.batch_size)
            .map_err(|_| DealSyncError::Validation(format!("invalid batch size {}", job.batch_size)))?;

        tracing::info!(
            %job_id,
            connection_id = %connection.id,
            total_batches = job.total_batches,
            "batch import started"
        );

        let mut after_id: Option<String> = None;
        let mut failed = 0usize;

        loop {
            let current = self.require_job(job_id).await?;
            if current.status == BatchJobStatus::Cancelled {
                tracing::info!(
                    %job_id,
                    processed_batches = current.processed_batches,
                    "batch import stopped on cancellation"
                );
                self.record_stats(connection.id, failed).await;
                return Ok(current);
            }

            let query = OpportunityQuery {
                limit: batch_size,
                modified_since: job.start_date,
                modified_until: job.end_date,
                stage_names: job.stage_names.clone(),
                after_id: after_id.clone(),
            };
            let page = crm.get_opportunities(&query).await?;
            if page.records.is_empty() {
                break;
            }
            let last_id = page.records.last().and_then(external_id_of).map(str::to_owned);

            let result = self.manager.apply_records(&connection, &page.records).await;
            failed += result.failed;
            let progress = self
                .jobs
                .record_progress(
                    job_id,
                    BatchProgress {
                        records: result.processed as i64,
                        created: result.created as i64,
                        updated: result.updated as i64,
                        failed: result.failed as i64,
                    },
                )
                .await?;
            tracing::debug!(
                %job_id,
                processed_batches = progress.processed_batches,
                total_batches = progress.total_batches,
                percent = progress.progress_percent(),
                "batch applied"
            );

            lease::renew(self.leases.as_ref(), lease, self.settings.lease_ttl()).await?;

            if page.done {
                break;
            }
            match last_id {
                Some(id) => after_id = Some(id),
                None => {
                    tracing::warn!(%job_id, "page ended with a record without Id, stopping");
                    break;
                }
            }
        }

        let finished = match self
            .jobs
            .transition(job_id, &[BatchJobStatus::Running], BatchJobStatus::Completed, None)
            .await?
        {
            Some(job) => job,
            // Cancelled while the last batch was in flight.
            None => self.require_job(job_id).await?,
        };
        self.record_stats(connection.id, failed).await;

        tracing::info!(
            %job_id,
            status = finished.status.as_str(),
            processed_records = finished.processed_records,
            created = finished.created_records,
            updated = finished.updated_records,
            failed = finished.failed_records,
            "batch import finished"
        );
        Ok(finished)
    }

    async fn estimate_with(
        &self,
        connection: &Connection,
        crm: &dyn CrmClient,
        request: &BatchRequest,
    ) -> DealSyncResult<BatchEstimate> {
        let batch_size = request
            .batch_size
            .or(connection.settings.batch_size)
            .unwrap_or(self.settings.batch_size);
        if batch_size == 0 {
            return Err(DealSyncError::Validation("batch size must be positive".to_string()));
        }

        let query = OpportunityQuery {
            limit: batch_size,
            modified_since: request.start_date,
            modified_until: request.end_date,
            stage_names: request.stage_names.clone(),
            after_id: None,
        };
        let total_records = crm.count_opportunities(&query).await?;
        let batches = total_batches(total_records, batch_size);

        Ok(BatchEstimate {
            total_records,
            batch_size,
            total_batches: batches,
            estimated_duration_secs: estimate_duration_secs(total_records, batches),
        })
    }

    async fn create_job(
        &self,
        connection: &Connection,
        request: &BatchRequest,
    ) -> DealSyncResult<BatchJob> {
        let crm = self.crm.client_for(connection)?;
        let estimate = self.estimate_with(connection, crm.as_ref(), request).await?;
        let batch_size = i32::try_from(estimate.batch_size)
            .map_err(|_| DealSyncError::Validation("batch size too large".to_string()))?;
        let now = Utc::now();

        self.jobs
            .create(BatchJob {
                id: Uuid::new_v4(),
                connection_id: connection.id,
                status: BatchJobStatus::Pending,
                start_date: request.start_date,
                end_date: request.end_date,
                stage_names: request.stage_names.clone(),
                batch_size,
                total_records: estimate.total_records as i64,
                total_batches: estimate.total_batches as i64,
                processed_batches: 0,
                processed_records: 0,
                created_records: 0,
                updated_records: 0,
                failed_records: 0,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
            })
            .await
    }

    async fn require_job(&self, job_id: Uuid) -> DealSyncResult<BatchJob> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| DealSyncError::NotFound(format!("batch job {job_id}")))
    }

    async fn record_stats(&self, connection_id: Uuid, failed: usize) {
        if let Err(e) = self.manager.record_stats(connection_id, failed).await {
            tracing::warn!(%connection_id, error = %e, "failed to update connection stats");
        }
    }
}

fn validate_request(request: &BatchRequest) -> DealSyncResult<()> {
    if let (Some(start), Some(end)) = (request.start_date, request.end_date) {
        if end <= start {
            return Err(DealSyncError::Validation(
                "end_date must be after start_date".to_string(),
            ));
        }
    }
    if request.batch_size == Some(0) {
        return Err(DealSyncError::Validation("batch size must be positive".to_string()));
    }
    Ok(())
}
