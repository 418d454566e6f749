//! Remote opportunity → local deal field mapping. Pure functions only.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use dealsync_common::error::DealSyncResult;
use dealsync_db::deals::models::{Deal, DealSyncStatus};

use crate::crm::models::{Opportunity, OPPORTUNITY_SCHEMA_VERSION};

pub const DEFAULT_CURRENCY: &str = "USD";

/// CRM-owned deal columns derived from one remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct DealFields {
    pub external_deal_id: String,
    pub title: String,
    pub amount: Option<f64>,
    pub currency: String,
    pub stage: String,
    pub probability: Option<f64>,
    pub customer_data: Option<Value>,
    pub deal_data: Value,
    pub created_at_source: Option<DateTime<Utc>>,
    pub updated_at_source: Option<DateTime<Utc>>,
}

pub fn to_deal_fields(record: &Value) -> DealSyncResult<DealFields> {
    let opp = Opportunity::from_record(record)?;

    let customer_data = opp.account.as_ref().map(|account| {
        json!({
            "account_id": account.id,
            "name": account.name,
            "industry": account.industry,
            "billing_city": account.billing_city,
            "billing_country": account.billing_country,
            "website": account.website,
            "phone": account.phone,
        })
    });

    let deal_data = json!({
        "schema_version": OPPORTUNITY_SCHEMA_VERSION,
        "close_date": opp.close_date,
        "description": opp.description,
        "last_modified_date": opp.last_modified_date,
        "raw": record,
    });

    let currency = opp
        .currency_iso_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_CURRENCY)
        .to_uppercase();

    Ok(DealFields {
        created_at_source: opp.created(),
        updated_at_source: opp.last_modified(),
        external_deal_id: opp.id.trim().to_string(),
        title: opp.name.trim().to_string(),
        amount: opp.amount,
        currency,
        stage: opp.stage_name.trim().to_string(),
        probability: opp.probability,
        customer_data,
        deal_data,
    })
}

/// A fresh deal row. `id` is provisional: on upsert conflict the stored id wins.
pub fn new_deal(connection_id: Uuid, fields: DealFields, now: DateTime<Utc>) -> Deal {
    Deal {
        id: Uuid::new_v4(),
        connection_id,
        external_deal_id: fields.external_deal_id,
        title: fields.title,
        amount: fields.amount,
        currency: fields.currency,
        stage: fields.stage,
        probability: fields.probability,
        customer_data: fields.customer_data,
        deal_data: Some(fields.deal_data),
        created_at_source: fields.created_at_source,
        updated_at_source: fields.updated_at_source,
        last_sync: now,
        sync_status: DealSyncStatus::Success,
        invoice_generated: false,
        invoice_data: None,
        created_at: now,
        updated_at: now,
    }
}

/// Overwrite the CRM-owned fields of an existing deal. The remote side always wins.
pub fn apply_fields(existing: Deal, fields: DealFields, now: DateTime<Utc>) -> Deal {
    Deal {
        title: fields.title,
        amount: fields.amount,
        currency: fields.currency,
        stage: fields.stage,
        probability: fields.probability,
        customer_data: fields.customer_data,
        deal_data: Some(fields.deal_data),
        created_at_source: fields.created_at_source,
        updated_at_source: fields.updated_at_source,
        last_sync: now,
        sync_status: DealSyncStatus::Success,
        updated_at: now,
        ..existing
    }
}
