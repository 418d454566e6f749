use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use dealsync_common::error::DealSyncResult;

/// Hash map + cursor store, namespaced per connection.
///
/// Hash maps expire after their TTL; the cursor does not expire and is only
/// removed by [`ChangeCache::clear`].
#[async_trait]
pub trait ChangeCache: Send + Sync {
    async fn get_hashes(&self, connection_id: Uuid) -> DealSyncResult<HashMap<String, String>>;

    /// Replace the whole map in a single write.
    async fn set_hashes(
        &self,
        connection_id: Uuid,
        hashes: &HashMap<String, String>,
        ttl: Duration,
    ) -> DealSyncResult<()>;

    async fn get_cursor(&self, connection_id: Uuid) -> DealSyncResult<Option<DateTime<Utc>>>;

    async fn set_cursor(&self, connection_id: Uuid, cursor: DateTime<Utc>) -> DealSyncResult<()>;

    /// Drop hashes and cursor, forcing the next cycle into full reconciliation.
    async fn clear(&self, connection_id: Uuid) -> DealSyncResult<()>;
}
