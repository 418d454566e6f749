use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::deals::models::{Deal, UpsertedDeal};
use dealsync_common::error::DealSyncResult;

#[async_trait]
pub trait DealRepository: Send + Sync {
    async fn get_by_external_id(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
    ) -> DealSyncResult<Option<Deal>>;

    /// Every deal of a connection, tombstones included.
    async fn list_by_connection(&self, connection_id: Uuid) -> DealSyncResult<Vec<Deal>>;

    /// Insert or update keyed by (connection_id, external_deal_id), in one transaction.
    /// On conflict the CRM-owned fields are overwritten; `id`, `created_at` and the
    /// invoice columns are preserved.
    async fn upsert(&self, deal: Deal) -> DealSyncResult<UpsertedDeal>;

    /// Tombstone a deal. Returns `None` when no such deal exists.
    async fn mark_deleted(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
        at: DateTime<Utc>,
    ) -> DealSyncResult<Option<Deal>>;

    /// Flag a deal whose last apply failed so detection force-updates it.
    async fn mark_failed(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
        at: DateTime<Utc>,
    ) -> DealSyncResult<bool>;

    /// Conditionally flip `invoice_generated` from false to true.
    /// Returns `false` when another caller already holds the claim.
    async fn claim_invoice(&self, deal_id: Uuid) -> DealSyncResult<bool>;

    async fn complete_invoice(
        &self,
        deal_id: Uuid,
        invoice_data: serde_json::Value,
    ) -> DealSyncResult<()>;

    async fn release_invoice_claim(&self, deal_id: Uuid) -> DealSyncResult<()>;
}
