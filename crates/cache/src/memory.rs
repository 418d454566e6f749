use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::traits::ChangeCache;
use dealsync_common::error::{DealSyncError, DealSyncResult};

#[derive(Default)]
struct Entry {
    /// Expiry of `None` means the TTL overflowed the clock; the map never expires.
    hashes: Option<(HashMap<String, String>, Option<Instant>)>,
    cursor: Option<DateTime<Utc>>,
}

/// Process-local cache for single-instance deployments without Redis.
/// State is lost on restart, which only costs one full reconciliation.
#[derive(Default)]
pub struct MemoryChangeCache {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl MemoryChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DealSyncResult<std::sync::MutexGuard<'_, HashMap<Uuid, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| DealSyncError::Cache("memory cache lock poisoned".into()))
    }
}

#[async_trait]
impl ChangeCache for MemoryChangeCache {
    async fn get_hashes(&self, connection_id: Uuid) -> DealSyncResult<HashMap<String, String>> {
        let mut entries = self.lock()?;
        let Some(entry) = entries.get_mut(&connection_id) else {
            return Ok(HashMap::new());
        };
        match &entry.hashes {
            Some((hashes, expires_at)) if expires_at.map_or(true, |at| at > Instant::now()) => {
                Ok(hashes.clone())
            }
            Some(_) => {
                entry.hashes = None;
                Ok(HashMap::new())
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn set_hashes(
        &self,
        connection_id: Uuid,
        hashes: &HashMap<String, String>,
        ttl: Duration,
    ) -> DealSyncResult<()> {
        let mut entries = self.lock()?;
        entries.entry(connection_id).or_default().hashes =
            Some((hashes.clone(), Instant::now().checked_add(ttl)));
        Ok(())
    }

    async fn get_cursor(&self, connection_id: Uuid) -> DealSyncResult<Option<DateTime<Utc>>> {
        Ok(self.lock()?.get(&connection_id).and_then(|e| e.cursor))
    }

    async fn set_cursor(&self, connection_id: Uuid, cursor: DateTime<Utc>) -> DealSyncResult<()> {
        self.lock()?.entry(connection_id).or_default().cursor = Some(cursor);
        Ok(())
    }

    async fn clear(&self, connection_id: Uuid) -> DealSyncResult<()> {
        self.lock()?.remove(&connection_id);
        Ok(())
    }
}
