use std::str::FromStr;
use std::time::Duration;

use dealsync_common::error::{DealSyncError, DealSyncResult};
use serde::{Deserialize, Serialize};

use crate::env::{get_opt, parse_var_or};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(format!("unknown hash algorithm: {other}")),
        }
    }
}

/// Tuning for detection, application and batch import. Every value can be
/// overridden with a `SYNC_`-prefixed environment variable.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub lookback_hours: u32,
    pub max_changes_per_sync: usize,
    pub max_fetch_size: usize,
    pub track_deletions: bool,
    pub cache_ttl_secs: u64,
    pub hash_algorithm: HashAlgorithm,
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub inter_chunk_delay_ms: u64,
    pub auto_generate_invoices: bool,
    pub invoice_stages: Vec<String>,
    pub max_reported_errors: usize,
    pub lease_ttl_secs: u64,
    pub disable_after_failures: i32,
    pub batch_size: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            max_changes_per_sync: 1000,
            max_fetch_size: 5000,
            track_deletions: false,
            cache_ttl_secs: 7 * 24 * 3600,
            hash_algorithm: HashAlgorithm::Md5,
            chunk_size: 50,
            max_concurrency: 5,
            inter_chunk_delay_ms: 100,
            auto_generate_invoices: true,
            invoice_stages: vec!["Closed Won".to_owned()],
            max_reported_errors: 50,
            lease_ttl_secs: 900,
            disable_after_failures: 5,
            batch_size: 100,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> DealSyncResult<Self> {
        let d = Self::default();
        let settings = Self {
            lookback_hours: parse_var_or("SYNC_LOOKBACK_HOURS", d.lookback_hours)?,
            max_changes_per_sync: parse_var_or("SYNC_MAX_CHANGES_PER_SYNC", d.max_changes_per_sync)?,
            max_fetch_size: parse_var_or("SYNC_MAX_FETCH_SIZE", d.max_fetch_size)?,
            track_deletions: parse_var_or("SYNC_TRACK_DELETIONS", d.track_deletions)?,
            cache_ttl_secs: parse_var_or("SYNC_CACHE_TTL_SECS", d.cache_ttl_secs)?,
            hash_algorithm: parse_var_or("SYNC_HASH_ALGORITHM", d.hash_algorithm)?,
            chunk_size: parse_var_or("SYNC_CHUNK_SIZE", d.chunk_size)?,
            max_concurrency: parse_var_or("SYNC_MAX_CONCURRENCY", d.max_concurrency)?,
            inter_chunk_delay_ms: parse_var_or("SYNC_INTER_CHUNK_DELAY_MS", d.inter_chunk_delay_ms)?,
            auto_generate_invoices: parse_var_or(
                "SYNC_AUTO_GENERATE_INVOICES",
                d.auto_generate_invoices,
            )?,
            invoice_stages: get_opt("SYNC_INVOICE_STAGES")
                .map(|raw| parse_csv(&raw))
                .unwrap_or(d.invoice_stages),
            max_reported_errors: parse_var_or("SYNC_MAX_REPORTED_ERRORS", d.max_reported_errors)?,
            lease_ttl_secs: parse_var_or("SYNC_LEASE_TTL_SECS", d.lease_ttl_secs)?,
            disable_after_failures: parse_var_or(
                "SYNC_DISABLE_AFTER_FAILURES",
                d.disable_after_failures,
            )?,
            batch_size: parse_var_or("SYNC_BATCH_SIZE", d.batch_size)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> DealSyncResult<()> {
        if self.chunk_size == 0 {
            return Err(DealSyncError::Config("SYNC_CHUNK_SIZE must be > 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(DealSyncError::Config("SYNC_MAX_CONCURRENCY must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(DealSyncError::Config("SYNC_BATCH_SIZE must be > 0".into()));
        }
        if self.max_changes_per_sync == 0 {
            return Err(DealSyncError::Config(
                "SYNC_MAX_CHANGES_PER_SYNC must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}
