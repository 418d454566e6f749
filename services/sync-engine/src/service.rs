use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dealsync_cache::ChangeCache;
use dealsync_common::error::{DealSyncError, DealSyncResult, RecordError};
use dealsync_config::SyncSettings;
use dealsync_db::batch::models::BatchJob;
use dealsync_db::batch::repositories::BatchJobRepository;
use dealsync_db::connections::models::{Connection, ConnectionStatus};
use dealsync_db::connections::repositories::ConnectionRepository;
use dealsync_db::deals::repositories::DealRepository;
use dealsync_db::leases::models::{TaskLease, TaskType};
use dealsync_db::leases::repositories::TaskLeaseRepository;

use crate::batch::{BatchEstimate, BatchOrchestrator, BatchRequest};
use crate::crm::CrmClientFactory;
use crate::detector::{ChangeDetector, DetectOptions};
use crate::invoice::InvoiceTrigger;
use crate::lease;
use crate::manager::{BatchResult, SyncManager};

const RECENT_JOBS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Compare everything the CRM returns, ignoring the cursor.
    Full,
    Delta,
    /// Accepted for compatibility; runs a delta pull where the remote side wins.
    Bidirectional,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Delta => "delta",
            Self::Bidirectional => "bidirectional",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualSyncRequest {
    pub mode: SyncMode,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub stage_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub mode: SyncMode,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    pub invoices_generated: usize,
    pub errors: Vec<RecordError>,
    pub duration_ms: u64,
    /// Cursor persisted by this cycle, if it advanced.
    pub next_cursor: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl SyncReport {
    fn from_result(mode: SyncMode, result: BatchResult, started: Instant) -> Self {
        Self {
            success: result.failed == 0,
            mode,
            processed: result.processed,
            created: result.created,
            updated: result.updated,
            deleted: result.deleted,
            failed: result.failed,
            invoices_generated: result.invoices_generated,
            errors: result.errors,
            duration_ms: elapsed_ms(started),
            next_cursor: None,
            message: None,
        }
    }

    fn failure(mode: SyncMode, err: &DealSyncError, started: Instant) -> Self {
        Self {
            success: false,
            errors: vec![RecordError::new(None, err)],
            message: Some(err.to_string()),
            ..Self::from_result(mode, BatchResult::default(), started)
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub connection_id: Uuid,
    pub status: ConnectionStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub total_deals: i64,
    pub total_invoices: i64,
    pub sync_error_count: i32,
    pub active_task: Option<TaskType>,
    pub cursor: Option<DateTime<Utc>>,
    pub cached_records: usize,
    pub recent_jobs: Vec<BatchJob>,
}

/// Collaborators the engine is wired from.
#[derive(Clone)]
pub struct SyncEngineDeps {
    pub connections: Arc<dyn ConnectionRepository>,
    pub deals: Arc<dyn DealRepository>,
    pub jobs: Arc<dyn BatchJobRepository>,
    pub leases: Arc<dyn TaskLeaseRepository>,
    pub cache: Arc<dyn ChangeCache>,
    pub crm: Arc<dyn CrmClientFactory>,
    pub invoices: Option<Arc<dyn InvoiceTrigger>>,
}

/// Connection must exist and be active.
pub(crate) async fn load_active_connection(
    connections: &dyn ConnectionRepository,
    connection_id: Uuid,
) -> DealSyncResult<Connection> {
    let connection = connections
        .get(connection_id)
        .await?
        .ok_or_else(|| DealSyncError::NotFound(format!("connection {connection_id}")))?;
    if !connection.is_active() {
        return Err(DealSyncError::Validation(format!(
            "connection {connection_id} is {}",
            connection.status.as_str()
        )));
    }
    Ok(connection)
}

/// Control surface of the sync engine.
pub struct SyncService {
    connections: Arc<dyn ConnectionRepository>,
    leases: Arc<dyn TaskLeaseRepository>,
    cache: Arc<dyn ChangeCache>,
    crm: Arc<dyn CrmClientFactory>,
    detector: ChangeDetector,
    manager: Arc<SyncManager>,
    orchestrator: Arc<BatchOrchestrator>,
    settings: SyncSettings,
}

impl SyncService {
    pub fn new(deps: SyncEngineDeps, settings: SyncSettings) -> Self {
        let manager = Arc::new(SyncManager::new(
            deps.deals.clone(),
            deps.connections.clone(),
            deps.invoices,
            settings.clone(),
        ));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            deps.connections.clone(),
            deps.jobs,
            deps.leases.clone(),
            deps.crm.clone(),
            manager.clone(),
            settings.clone(),
        ));
        let detector = ChangeDetector::new(deps.deals, deps.cache.clone(), settings.clone());

        Self {
            connections: deps.connections,
            leases: deps.leases,
            cache: deps.cache,
            crm: deps.crm,
            detector,
            manager,
            orchestrator,
            settings,
        }
    }

    /// One detection + apply cycle. `force_full` ignores the cursor.
    pub async fn delta_sync(&self, connection_id: Uuid, force_full: bool) -> DealSyncResult<SyncReport> {
        let options = DetectOptions {
            force_full,
            ..DetectOptions::default()
        };
        self.leased_cycle(connection_id, TaskType::DeltaSync, SyncMode::Delta, options)
            .await
    }

    pub async fn manual_sync(
        &self,
        connection_id: Uuid,
        request: ManualSyncRequest,
    ) -> DealSyncResult<SyncReport> {
        if request.limit == Some(0) {
            return Err(DealSyncError::Validation("limit must be positive".to_string()));
        }
        if request.mode == SyncMode::Bidirectional {
            tracing::info!(%connection_id, "bidirectional sync pulls only; remote changes win");
        }
        let options = DetectOptions {
            force_full: request.mode == SyncMode::Full,
            stage_names: request.stage_names,
            max_fetch: request.limit,
        };
        self.leased_cycle(connection_id, TaskType::ManualSync, request.mode, options)
            .await
    }

    pub async fn estimate_batch(
        &self,
        connection_id: Uuid,
        request: &BatchRequest,
    ) -> DealSyncResult<BatchEstimate> {
        self.orchestrator.estimate(connection_id, request).await
    }

    pub async fn start_batch(
        &self,
        connection_id: Uuid,
        request: BatchRequest,
    ) -> DealSyncResult<BatchJob> {
        self.orchestrator.start(connection_id, request).await
    }

    pub async fn cancel_batch(&self, job_id: Uuid) -> DealSyncResult<BatchJob> {
        self.orchestrator.cancel(job_id).await
    }

    pub async fn retry_batch(&self, job_id: Uuid) -> DealSyncResult<BatchJob> {
        self.orchestrator.retry(job_id).await
    }

    pub async fn batch_status(&self, job_id: Uuid) -> DealSyncResult<BatchJob> {
        self.orchestrator.status(job_id).await
    }

    pub async fn sync_status(&self, connection_id: Uuid) -> DealSyncResult<SyncStatus> {
        let connection = self
            .connections
            .get(connection_id)
            .await?
            .ok_or_else(|| DealSyncError::NotFound(format!("connection {connection_id}")))?;
        let active_task = self
            .leases
            .get_active(connection_id)
            .await?
            .map(|l| l.task_type);

        let cursor = self.cache.get_cursor(connection_id).await.unwrap_or_else(|e| {
            tracing::warn!(%connection_id, error = %e, "cursor unavailable");
            None
        });
        let cached_records = self
            .cache
            .get_hashes(connection_id)
            .await
            .map(|h| h.len())
            .unwrap_or_else(|e| {
                tracing::warn!(%connection_id, error = %e, "hash cache unavailable");
                0
            });
        let recent_jobs = self
            .orchestrator
            .recent_jobs(connection_id, RECENT_JOBS)
            .await?;

        Ok(SyncStatus {
            connection_id,
            status: connection.status,
            last_sync: connection.last_sync,
            last_successful_sync: connection.last_successful_sync,
            total_deals: connection.total_deals,
            total_invoices: connection.total_invoices,
            sync_error_count: connection.sync_error_count,
            active_task,
            cursor,
            cached_records,
            recent_jobs,
        })
    }

    /// Forget hashes and cursor; the next cycle falls back to the lookback window.
    pub async fn clear_cache(&self, connection_id: Uuid) -> DealSyncResult<()> {
        self.cache.clear(connection_id).await?;
        tracing::info!(%connection_id, "change cache cleared");
        Ok(())
    }

    async fn leased_cycle(
        &self,
        connection_id: Uuid,
        task_type: TaskType,
        mode: SyncMode,
        options: DetectOptions,
    ) -> DealSyncResult<SyncReport> {
        let connection = load_active_connection(self.connections.as_ref(), connection_id).await?;
        let held = lease::acquire(
            self.leases.as_ref(),
            connection_id,
            task_type,
            self.settings.lease_ttl(),
        )
        .await?;

        let report = self.run_cycle(&connection, &held, mode, &options).await;
        lease::release(self.leases.as_ref(), &held).await;
        report
    }

    async fn run_cycle(
        &self,
        connection: &Connection,
        held: &TaskLease,
        mode: SyncMode,
        options: &DetectOptions,
    ) -> DealSyncResult<SyncReport> {
        let started = Instant::now();

        let detection = match self.crm.client_for(connection) {
            Ok(crm) => self.detector.detect(connection, crm.as_ref(), options).await,
            Err(e) => Err(e),
        };
        let detection = match detection {
            Ok(d) => d,
            Err(e) => return self.fail_cycle(connection, mode, started, e).await,
        };
        if let Err(e) = lease::renew(self.leases.as_ref(), held, self.settings.lease_ttl()).await {
            return self.fail_cycle(connection, mode, started, e).await;
        }

        let result = self.manager.apply_changes(connection, &detection.changes).await;
        let renewed = lease::renew(self.leases.as_ref(), held, self.settings.lease_ttl()).await;
        let still_held = match renewed {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(connection_id = %connection.id, error = %e, "lease lost during apply");
                false
            }
        };

        // The cursor only moves past a window that was read in full and applied.
        let partial = !options.stage_names.is_empty() || options.max_fetch.is_some();
        let advance = still_held
            && !partial
            && detection.overflow == 0
            && !result.has_transient_failures();
        let next_cursor = if advance {
            match self.cache.set_cursor(connection.id, detection.next_cursor).await {
                Ok(()) => Some(detection.next_cursor),
                Err(e) => {
                    tracing::warn!(connection_id = %connection.id, error = %e, "failed to persist cursor");
                    None
                }
            }
        } else {
            tracing::debug!(
                connection_id = %connection.id,
                partial,
                lease_held = still_held,
                overflow = detection.overflow,
                "cursor held back"
            );
            None
        };

        if let Err(e) = self.manager.record_stats(connection.id, result.failed).await {
            tracing::warn!(connection_id = %connection.id, error = %e, "failed to update connection stats");
        }

        let mut report = SyncReport::from_result(mode, result, started);
        report.next_cursor = next_cursor;
        tracing::info!(
            connection_id = %connection.id,
            mode = mode.as_str(),
            processed = report.processed,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Systemic failures propagate; anything else becomes a failed report.
    async fn fail_cycle(
        &self,
        connection: &Connection,
        mode: SyncMode,
        started: Instant,
        err: DealSyncError,
    ) -> DealSyncResult<SyncReport> {
        tracing::error!(
            connection_id = %connection.id,
            mode = mode.as_str(),
            kind = err.kind().as_str(),
            error = %err,
            "sync cycle failed"
        );
        if let Err(e) = self.manager.record_stats(connection.id, 1).await {
            tracing::warn!(connection_id = %connection.id, error = %e, "failed to update connection stats");
        }
        if err.is_systemic() {
            return Err(err);
        }
        Ok(SyncReport::failure(mode, &err, started))
    }
}
