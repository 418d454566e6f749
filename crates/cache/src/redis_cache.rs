use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::traits::ChangeCache;
use dealsync_common::error::{DealSyncError, DealSyncResult};

const DEFAULT_PREFIX: &str = "dealsync";

#[derive(Clone)]
pub struct RedisChangeCache {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisChangeCache {
    pub async fn connect(url: &str, prefix: Option<&str>) -> DealSyncResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| DealSyncError::Cache(format!("redis client open: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| DealSyncError::Cache(format!("redis connect: {e}")))?;
        Ok(Self {
            manager,
            prefix: scoped_prefix(prefix),
        })
    }

    fn hashes_key(&self, connection_id: Uuid) -> String {
        key(&self.prefix, connection_id, "hashes")
    }

    fn cursor_key(&self, connection_id: Uuid) -> String {
        key(&self.prefix, connection_id, "cursor")
    }
}

fn scoped_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PREFIX)
        .to_owned()
}

fn key(prefix: &str, connection_id: Uuid, name: &str) -> String {
    format!("{prefix}:conn:{connection_id}:{name}")
}

fn cache_err(op: &str, e: impl std::fmt::Display) -> DealSyncError {
    DealSyncError::Cache(format!("{op}: {e}"))
}

#[async_trait]
impl ChangeCache for RedisChangeCache {
    async fn get_hashes(&self, connection_id: Uuid) -> DealSyncResult<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(self.hashes_key(connection_id))
            .await
            .map_err(|e| cache_err("redis get hashes", e))?;

        match raw {
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| cache_err("decode cached hashes", e))
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
        let json = serde_json::to_string(hashes).map_err(|e| cache_err("encode hashes", e))?;
        let mut conn = self.manager.clone();
        // One SET EX keeps the map all-or-nothing.
        conn.set_ex::<_, _, ()>(self.hashes_key(connection_id), json, ttl.as_secs().max(1))
            .await
            .map_err(|e| cache_err("redis set hashes", e))
    }

    async fn get_cursor(&self, connection_id: Uuid) -> DealSyncResult<Option<DateTime<Utc>>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(self.cursor_key(connection_id))
            .await
            .map_err(|e| cache_err("redis get cursor", e))?;

        raw.map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| cache_err("parse cursor", e))
        })
        .transpose()
    }

    async fn set_cursor(&self, connection_id: Uuid, cursor: DateTime<Utc>) -> DealSyncResult<()> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(self.cursor_key(connection_id), cursor.to_rfc3339())
            .await
            .map_err(|e| cache_err("redis set cursor", e))
    }

    async fn clear(&self, connection_id: Uuid) -> DealSyncResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(&[self.hashes_key(connection_id), self.cursor_key(connection_id)])
            .await
            .map_err(|e| cache_err("redis del", e))
    }
}
