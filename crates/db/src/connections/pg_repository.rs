use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::connections::models::{Connection, ConnectionSettings};
use crate::connections::repositories::ConnectionRepository;
use dealsync_common::error::{DealSyncError, DealSyncResult};

const COLUMNS: &str = "id, organization_id, credentials, settings, status, last_sync,
    last_successful_sync, total_deals, total_invoices, sync_error_count, created_at, updated_at";

#[derive(Clone)]
pub struct PgConnectionRepository {
    pool: PgPool,
}

impl PgConnectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: sqlx::postgres::PgRow) -> DealSyncResult<Connection> {
        let status: String = row.get("status");
        let settings: Json<ConnectionSettings> = row.get("settings");
        Ok(Connection {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            credentials: row.get("credentials"),
            settings: settings.0,
            status: status.parse().map_err(DealSyncError::Database)?,
            last_sync: row.get("last_sync"),
            last_successful_sync: row.get("last_successful_sync"),
            total_deals: row.get("total_deals"),
            total_invoices: row.get("total_invoices"),
            sync_error_count: row.get("sync_error_count"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl ConnectionRepository for PgConnectionRepository {
    async fn get(&self, id: Uuid) -> DealSyncResult<Option<Connection>> {
        let row = sqlx::query(&format!("select {COLUMNS} from crm_connections where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn list_active(&self) -> DealSyncResult<Vec<Connection>> {
        let rows = sqlx::query(&format!(
            "select {COLUMNS} from crm_connections where status = 'active' order by created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn record_sync(
        &self,
        id: Uuid,
        failed: usize,
        disable_after: i32,
    ) -> DealSyncResult<Connection> {
        let row = sqlx::query(&format!(
            "update crm_connections set
               last_sync = $2,
               last_successful_sync = case when $3 = 0 then $2 else last_successful_sync end,
               sync_error_count = case when $3 = 0 then 0 else sync_error_count + 1 end,
               status = case
                 when $3 > 0 and sync_error_count + 1 >= $4 then 'error'
                 else status
               end,
               total_deals = (
                 select count(*) from deals d
                 where d.connection_id = $1 and d.sync_status != 'deleted'
               ),
               updated_at = $2
             where id = $1
             returning {COLUMNS}"
        ))
        .bind(id)
        .bind(Utc::now())
        .bind(failed as i64)
        .bind(disable_after)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        match row {
            Some(r) => Self::map_row(r),
            None => Err(DealSyncError::NotFound(format!("connection {id}"))),
        }
    }

    async fn add_invoices(&self, id: Uuid, count: i64) -> DealSyncResult<()> {
        sqlx::query(
            "update crm_connections
             set total_invoices = total_invoices + $2, updated_at = now()
             where id = $1",
        )
        .bind(id)
        .bind(count)
        .execute(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;
        Ok(())
    }
}
