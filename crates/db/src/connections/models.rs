use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    /// Soft-disabled after repeated sync failures.
    Error,
    Disabled,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("unknown connection status: {value}")),
        }
    }
}

/// What to do when a deal lands in a given stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    GenerateInvoice,
    Ignore,
}

/// Per-connection overrides of the global sync settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub lookback_hours: Option<u32>,
    /// Remote stage name → action. Empty means "use the global invoice stages".
    #[serde(default)]
    pub stage_mappings: HashMap<String, StageAction>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Opaque to the engine; handed to the CRM client factory as-is.
    pub credentials: serde_json::Value,
    pub settings: ConnectionSettings,
    pub status: ConnectionStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub total_deals: i64,
    pub total_invoices: i64,
    pub sync_error_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

// Credentials stay out of logs.
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("organization_id", &self.organization_id)
            .field("credentials", &"<redacted>")
            .field("settings", &self.settings)
            .field("status", &self.status)
            .field("last_sync", &self.last_sync)
            .field("last_successful_sync", &self.last_successful_sync)
            .field("total_deals", &self.total_deals)
            .field("total_invoices", &self.total_invoices)
            .field("sync_error_count", &self.sync_error_count)
            .finish()
    }
}
