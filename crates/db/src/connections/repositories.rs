use async_trait::async_trait;
use uuid::Uuid;

use crate::connections::models::Connection;
use dealsync_common::error::DealSyncResult;

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> DealSyncResult<Option<Connection>>;

    /// Connections eligible for scheduled sync.
    async fn list_active(&self) -> DealSyncResult<Vec<Connection>>;

    /// Record the outcome of a sync run.
    ///
    /// `last_sync` always moves. With zero failures `last_successful_sync` moves too
    /// and the error counter resets; otherwise the counter increments and the
    /// connection is soft-disabled once it reaches `disable_after`.
    async fn record_sync(
        &self,
        id: Uuid,
        failed: usize,
        disable_after: i32,
    ) -> DealSyncResult<Connection>;

    async fn add_invoices(&self, id: Uuid, count: i64) -> DealSyncResult<()>;
}
