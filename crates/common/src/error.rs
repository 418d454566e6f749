use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DealSyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type DealSyncResult<T> = Result<T, DealSyncError>;

/// How a caller should treat a failure.
///
/// Transient failures clear up on the next natural sync cycle, permanent ones
/// abort the surrounding operation, and validation failures are scoped to a
/// single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Validation => "validation",
        }
    }
}

impl DealSyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) | Self::Remote(_) | Self::Cache(_) => ErrorKind::Transient,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Config(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::Auth(_)
            | Self::Internal(_) => ErrorKind::Permanent,
        }
    }

    /// Errors that must abort a whole sync operation rather than a single record.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_))
    }
}

/// A per-record failure collected into a sync result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub external_id: Option<String>,
    pub kind: ErrorKind,
    pub detail: String,
}

impl RecordError {
    pub fn new(external_id: Option<&str>, err: &DealSyncError) -> Self {
        Self {
            external_id: external_id.map(str::to_owned),
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}
