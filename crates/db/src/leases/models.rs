use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kinds of work that are serialized per connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BatchImport,
    DeltaSync,
    ManualSync,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchImport => "batch_import",
            Self::DeltaSync => "delta_sync",
            Self::ManualSync => "manual_sync",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "batch_import" => Ok(Self::BatchImport),
            "delta_sync" => Ok(Self::DeltaSync),
            "manual_sync" => Ok(Self::ManualSync),
            _ => Err(format!("unknown task type: {value}")),
        }
    }
}

/// At most one unexpired lease exists per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskLease {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub task_type: TaskType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
