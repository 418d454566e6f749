use dealsync_common::error::{DealSyncError, DealSyncResult};
use std::env;
use std::str::FromStr;

use crate::settings::SyncSettings;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub log_level: String,
    pub poll_interval_secs: u64,
    pub invoice_service_url: Option<String>,
    pub crm_api_version: String,
    pub crm_timeout_secs: u64,
    pub crm_max_retries: u32,
    pub sync: SyncSettings,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> DealSyncResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            redis_url: get_opt("REDIS_URL"),
            log_level: get_var_or("LOG_LEVEL", "info"),
            poll_interval_secs: parse_var_or("SYNC_POLL_INTERVAL_SECS", 300)?,
            invoice_service_url: get_opt("INVOICE_SERVICE_URL"),
            crm_api_version: get_var_or("CRM_API_VERSION", "v59.0"),
            crm_timeout_secs: parse_var_or("CRM_TIMEOUT_SECS", 30)?,
            crm_max_retries: parse_var_or("CRM_MAX_RETRIES", 3)?,
            sync: SyncSettings::from_env()?,
        })
    }
}

fn get_var(key: &str) -> DealSyncResult<String> {
    env::var(key).map_err(|_| DealSyncError::Config(format!("{key} is required but not set")))
}

pub(crate) fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Unset and blank values are both treated as absent.
pub(crate) fn get_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Parse an optional variable, failing fast when it is set but malformed.
pub(crate) fn parse_var_or<T>(key: &str, default: T) -> DealSyncResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| DealSyncError::Config(format!("invalid {key}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_env_succeeds_with_required_vars() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::set_var("DATABASE_URL", "postgres://localhost/dealsync_test");
        env::remove_var("REDIS_URL");
        env::remove_var("SYNC_POLL_INTERVAL_SECS");

        let cfg = AppConfig::from_env().expect("should parse config");
        assert_eq!(cfg.database_url, "postgres://localhost/dealsync_test");
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.poll_interval_secs, 300);
        assert_eq!(cfg.crm_api_version, "v59.0");
        assert_eq!(cfg.sync.lookback_hours, 24);

        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn config_from_env_fails_without_database_url() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::remove_var("DATABASE_URL");
        let result = AppConfig::from_env();
        assert!(matches!(result, Err(DealSyncError::Config(_))));
    }

    #[test]
    fn malformed_number_is_a_config_error() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::set_var("DATABASE_URL", "postgres://localhost/dealsync_test");
        env::set_var("SYNC_POLL_INTERVAL_SECS", "soon");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("SYNC_POLL_INTERVAL_SECS"), "got: {err}");

        env::remove_var("SYNC_POLL_INTERVAL_SECS");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn blank_optional_values_are_absent() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");

        env::set_var("_DS_TEST_BLANK", "   ");
        assert!(get_opt("_DS_TEST_BLANK").is_none());
        env::remove_var("_DS_TEST_BLANK");
    }
}
