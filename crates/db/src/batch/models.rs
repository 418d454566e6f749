use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for BatchJobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown batch job status: {value}")),
        }
    }
}

/// A resumable backfill over a modified-date window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJob {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub status: BatchJobStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub stage_names: Vec<String>,
    pub batch_size: i32,
    pub total_records: i64,
    pub total_batches: i64,
    pub processed_batches: i64,
    pub processed_records: i64,
    pub created_records: i64,
    pub updated_records: i64,
    pub failed_records: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn progress_percent(&self) -> f64 {
        if self.total_batches <= 0 {
            return if self.status == BatchJobStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.processed_batches as f64 / self.total_batches as f64 * 100.0).min(100.0)
    }
}

/// Counter increments for one completed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProgress {
    pub records: i64,
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
}
