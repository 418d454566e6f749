use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Classification of a detected change.
///
/// Precedence when several fields moved: stage, then amount, then generic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
    StageChanged,
    AmountChanged,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::StageChanged => "stage_changed",
            Self::AmountChanged => "amount_changed",
        }
    }

    /// Changes that write the remote record over an existing deal.
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Updated | Self::StageChanged | Self::AmountChanged)
    }
}

/// Old and new value of one tracked field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub external_id: String,
    pub change_type: ChangeType,
    /// Only populated for updates; ordered title, amount, stage, probability.
    pub changes: Vec<FieldChange>,
    pub detected_at: DateTime<Utc>,
    /// The remote record; absent for deletions.
    pub record: Option<Value>,
}

impl ChangeRecord {
    pub fn field(&self, name: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field == name)
    }
}

/// Pick the change type for an update from its field diffs.
pub fn classify(changes: &[FieldChange]) -> ChangeType {
    if changes.iter().any(|c| c.field == "stage") {
        ChangeType::StageChanged
    } else if changes.iter().any(|c| c.field == "amount") {
        ChangeType::AmountChanged
    } else {
        ChangeType::Updated
    }
}
