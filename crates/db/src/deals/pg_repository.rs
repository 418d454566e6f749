use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::deals::models::{Deal, UpsertedDeal};
use crate::deals::repositories::DealRepository;
use dealsync_common::error::{DealSyncError, DealSyncResult};

const COLUMNS: &str = "id, connection_id, external_deal_id, title, amount, currency, stage,
    probability, customer_data, deal_data, created_at_source, updated_at_source, last_sync,
    sync_status, invoice_generated, invoice_data, created_at, updated_at";

#[derive(Clone)]
pub struct PgDealRepository {
    pool: PgPool,
}

impl PgDealRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &sqlx::postgres::PgRow) -> DealSyncResult<Deal> {
        let status: String = row.get("sync_status");
        Ok(Deal {
            id: row.get("id"),
            connection_id: row.get("connection_id"),
            external_deal_id: row.get("external_deal_id"),
            title: row.get("title"),
            amount: row.get("amount"),
            currency: row.get("currency"),
            stage: row.get("stage"),
            probability: row.get("probability"),
            customer_data: row.get("customer_data"),
            deal_data: row.get("deal_data"),
            created_at_source: row.get("created_at_source"),
            updated_at_source: row.get("updated_at_source"),
            last_sync: row.get("last_sync"),
            sync_status: status.parse().map_err(DealSyncError::Database)?,
            invoice_generated: row.get("invoice_generated"),
            invoice_data: row.get("invoice_data"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl DealRepository for PgDealRepository {
    async fn get_by_external_id(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
    ) -> DealSyncResult<Option<Deal>> {
        let row = sqlx::query(&format!(
            "select {COLUMNS} from deals where connection_id = $1 and external_deal_id = $2"
        ))
        .bind(connection_id)
        .bind(external_deal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_by_connection(&self, connection_id: Uuid) -> DealSyncResult<Vec<Deal>> {
        let rows = sqlx::query(&format!(
            "select {COLUMNS} from deals where connection_id = $1 order by external_deal_id"
        ))
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        rows.iter().map(Self::map_row).collect()
    }

    async fn upsert(&self, deal: Deal) -> DealSyncResult<UpsertedDeal> {
        // xmax = 0 only for a freshly inserted tuple.
        let row = sqlx::query(&format!(
            "insert into deals
             (id, connection_id, external_deal_id, title, amount, currency, stage, probability,
              customer_data, deal_data, created_at_source, updated_at_source, last_sync,
              sync_status, invoice_generated, invoice_data, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
             on conflict (connection_id, external_deal_id) do update set
               title = excluded.title,
               amount = excluded.amount,
               currency = excluded.currency,
               stage = excluded.stage,
               probability = excluded.probability,
               customer_data = excluded.customer_data,
               deal_data = excluded.deal_data,
               created_at_source = excluded.created_at_source,
               updated_at_source = excluded.updated_at_source,
               last_sync = excluded.last_sync,
               sync_status = excluded.sync_status,
               updated_at = excluded.updated_at
             returning {COLUMNS}, (xmax = 0) as inserted"
        ))
        .bind(deal.id)
        .bind(deal.connection_id)
        .bind(&deal.external_deal_id)
        .bind(&deal.title)
        .bind(deal.amount)
        .bind(&deal.currency)
        .bind(&deal.stage)
        .bind(deal.probability)
        .bind(&deal.customer_data)
        .bind(&deal.deal_data)
        .bind(deal.created_at_source)
        .bind(deal.updated_at_source)
        .bind(deal.last_sync)
        .bind(deal.sync_status.as_str())
        .bind(deal.invoice_generated)
        .bind(&deal.invoice_data)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        Ok(UpsertedDeal {
            deal: Self::map_row(&row)?,
            inserted: row.get("inserted"),
        })
    }

    async fn mark_deleted(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
        at: DateTime<Utc>,
    ) -> DealSyncResult<Option<Deal>> {
        let row = sqlx::query(&format!(
            "update deals
             set sync_status = 'deleted', last_sync = $3, updated_at = $3
             where connection_id = $1 and external_deal_id = $2
             returning {COLUMNS}"
        ))
        .bind(connection_id)
        .bind(external_deal_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn mark_failed(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
        at: DateTime<Utc>,
    ) -> DealSyncResult<bool> {
        let result = sqlx::query(
            "update deals
             set sync_status = 'failed', updated_at = $3
             where connection_id = $1 and external_deal_id = $2 and sync_status != 'deleted'",
        )
        .bind(connection_id)
        .bind(external_deal_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_invoice(&self, deal_id: Uuid) -> DealSyncResult<bool> {
        let result = sqlx::query(
            "update deals
             set invoice_generated = true, updated_at = now()
             where id = $1 and invoice_generated = false",
        )
        .bind(deal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_invoice(
        &self,
        deal_id: Uuid,
        invoice_data: serde_json::Value,
    ) -> DealSyncResult<()> {
        sqlx::query("update deals set invoice_data = $2, updated_at = now() where id = $1")
            .bind(deal_id)
            .bind(invoice_data)
            .execute(&self.pool)
            .await
            .map_err(|e| DealSyncError::Database(e.to_string()))?;
        Ok(())
    }

    async fn release_invoice_claim(&self, deal_id: Uuid) -> DealSyncResult<()> {
        sqlx::query(
            "update deals
             set invoice_generated = false, invoice_data = null, updated_at = now()
             where id = $1",
        )
        .bind(deal_id)
        .execute(&self.pool)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))?;
        Ok(())
    }
}
