//! Read-only access to the remote CRM's opportunities.

pub mod client;
pub mod models;
pub mod query;

use std::sync::Arc;

use async_trait::async_trait;

use dealsync_common::error::DealSyncResult;
use dealsync_db::connections::models::Connection;

pub use client::{SalesforceClient, SalesforceClientConfig, SalesforceClientFactory};
pub use models::{Opportunity, OpportunityPage, OpportunityQuery};

#[async_trait]
pub trait CrmClient: Send + Sync {
    /// One page of records matching the query, ordered by `Id`.
    async fn get_opportunities(&self, query: &OpportunityQuery) -> DealSyncResult<OpportunityPage>;

    async fn count_opportunities(&self, query: &OpportunityQuery) -> DealSyncResult<u64>;

    async fn get_opportunity_by_id(&self, id: &str) -> DealSyncResult<Option<serde_json::Value>>;
}

/// Creates a CRM client bound to one connection's credentials.
pub trait CrmClientFactory: Send + Sync {
    fn client_for(&self, connection: &Connection) -> DealSyncResult<Arc<dyn CrmClient>>;
}

/// Page through the CRM with the `Id` cursor until exhausted or `max` records.
pub async fn fetch_all(
    client: &dyn CrmClient,
    mut query: OpportunityQuery,
    max: usize,
) -> DealSyncResult<Vec<serde_json::Value>> {
    let page_size = query.limit.max(1);
    let mut records = Vec::new();

    while records.len() < max {
        let remaining = u32::try_from(max - records.len()).unwrap_or(u32::MAX);
        query.limit = page_size.min(remaining);

        let page = client.get_opportunities(&query).await?;
        let last_id = page
            .records
            .last()
            .and_then(models::external_id_of)
            .map(str::to_owned);
        let page_len = page.records.len();
        records.extend(page.records);

        if page.done || page_len < query.limit as usize {
            break;
        }
        match last_id {
            Some(id) => query.after_id = Some(id),
            None => {
                tracing::warn!("CRM page ended with a record without Id, stopping pagination");
                break;
            }
        }
    }

    if records.len() >= max {
        tracing::warn!(max, "CRM fetch hit the record limit");
    }
    records.truncate(max);
    Ok(records)
}
