use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use dealsync_common::error::{DealSyncError, DealSyncResult};
use dealsync_db::connections::repositories::ConnectionRepository;

use crate::service::SyncService;

/// Outcome counts of one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub synced: usize,
    /// Connections busy with another task.
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically runs a delta sync for every active connection.
pub struct Scheduler {
    service: Arc<SyncService>,
    connections: Arc<dyn ConnectionRepository>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        service: Arc<SyncService>,
        connections: Arc<dyn ConnectionRepository>,
        interval: Duration,
    ) -> Self {
        Self {
            service,
            connections,
            interval,
        }
    }

    /// Loop forever. A tick that overruns the interval delays the next one.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(summary) => tracing::info!(
                    synced = summary.synced,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "scheduled sync pass finished"
                ),
                Err(e) => tracing::error!(error = %e, "scheduled sync pass failed"),
            }
        }
    }

    /// Sync each active connection once, sequentially.
    pub async fn tick(&self) -> DealSyncResult<TickSummary> {
        let connections = self.connections.list_active().await?;
        let mut summary = TickSummary::default();

        for connection in connections {
            match self.service.delta_sync(connection.id, false).await {
                Ok(report) if report.success => summary.synced += 1,
                Ok(report) => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        failed = report.failed,
                        message = report.message.as_deref().unwrap_or_default(),
                        "scheduled sync finished with failures"
                    );
                    summary.failed += 1;
                }
                Err(DealSyncError::Conflict(reason)) => {
                    tracing::info!(connection_id = %connection.id, %reason, "connection busy, skipping");
                    summary.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(connection_id = %connection.id, error = %e, "scheduled sync failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
