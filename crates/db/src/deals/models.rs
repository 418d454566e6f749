use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DealSyncStatus {
    Success,
    Failed,
    /// Tombstone: the remote opportunity is gone, the row stays.
    Deleted,
}

impl DealSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for DealSyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("unknown deal sync status: {value}")),
        }
    }
}

/// Local mirror of a remote opportunity, unique on (connection_id, external_deal_id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deal {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub external_deal_id: String,
    pub title: String,
    pub amount: Option<f64>,
    pub currency: String,
    pub stage: String,
    pub probability: Option<f64>,
    pub customer_data: Option<serde_json::Value>,
    pub deal_data: Option<serde_json::Value>,
    pub created_at_source: Option<DateTime<Utc>>,
    pub updated_at_source: Option<DateTime<Utc>>,
    pub last_sync: DateTime<Utc>,
    pub sync_status: DealSyncStatus,
    pub invoice_generated: bool,
    pub invoice_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone)]
pub struct UpsertedDeal {
    pub deal: Deal,
    pub inserted: bool,
}
