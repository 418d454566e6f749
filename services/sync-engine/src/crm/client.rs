use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use dealsync_common::error::{DealSyncError, DealSyncResult};
use dealsync_db::connections::models::Connection;

use super::models::{OpportunityPage, OpportunityQuery};
use super::query::{build_by_id_soql, build_count_soql, build_opportunity_soql};
use super::{CrmClient, CrmClientFactory};

#[derive(Debug, Clone)]
pub struct SalesforceClientConfig {
    pub instance_url: String,
    pub access_token: String,
    pub api_version: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// First retry waits twice this long; later retries double up to 30s.
    pub backoff_base_ms: u64,
}

#[derive(Deserialize)]
struct Credentials {
    instance_url: String,
    access_token: String,
}

impl SalesforceClientConfig {
    /// Build a config from a connection's stored credentials
    /// (`{"instance_url": ..., "access_token": ...}`).
    pub fn from_credentials(
        credentials: &serde_json::Value,
        api_version: &str,
        max_retries: u32,
        timeout_secs: u64,
    ) -> DealSyncResult<Self> {
        let creds: Credentials = serde_json::from_value(credentials.clone())
            .map_err(|e| DealSyncError::Auth(format!("invalid CRM credentials: {e}")))?;
        if creds.instance_url.trim().is_empty() || creds.access_token.trim().is_empty() {
            return Err(DealSyncError::Auth("CRM credentials are incomplete".to_string()));
        }

        Ok(Self {
            instance_url: creds.instance_url.trim_end_matches('/').to_string(),
            access_token: creds.access_token,
            api_version: api_version.to_string(),
            max_retries,
            timeout_secs,
            backoff_base_ms: 1000,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrmClientError {
    #[error("unauthorized (HTTP {status}): {body}")]
    Unauthorized { status: StatusCode, body: String },

    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl From<CrmClientError> for DealSyncError {
    fn from(err: CrmClientError) -> Self {
        match err {
            CrmClientError::Unauthorized { .. } => DealSyncError::Auth(err.to_string()),
            other => DealSyncError::Remote(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    total_size: u64,
    done: bool,
    #[serde(default)]
    records: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct SalesforceClient {
    client: Client,
    config: SalesforceClientConfig,
}

impl SalesforceClient {
    pub fn new(config: SalesforceClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// For testing: create a client pointing at a specific instance URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_instance_url(mut self, instance_url: &str) -> Self {
        self.config.instance_url = instance_url.to_string();
        self
    }

    async fn query(&self, soql: &str) -> Result<QueryResponse, CrmClientError> {
        let url = format!(
            "{}/services/data/{}/query",
            self.config.instance_url, self.config.api_version
        );
        tracing::debug!(soql, "running CRM query");
        self.request_with_retry(&url, &[("q", soql)]).await
    }

    async fn request_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<T, CrmClientError> {
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff_ms = std::cmp::min(
                    self.config.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)),
                    30_000,
                );
                tracing::warn!(attempt, backoff_ms, "retrying CRM request after backoff");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }

            let response = match self
                .client
                .get(url)
                .query(params)
                .bearer_auth(&self.config.access_token)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_timeout() || e.is_connect() {
                        continue;
                    }
                    return Err(CrmClientError::RequestError(e));
                }
            };

            let status = response.status();

            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(CrmClientError::RequestError);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if let Some(retry_after) = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    let wait = std::cmp::min(retry_after, 60);
                    tracing::warn!(wait, "CRM rate limit hit, waiting Retry-After");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                last_error = "429 Too Many Requests".to_string();
                continue;
            }

            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = format!("{status}: {body}");
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(CrmClientError::Unauthorized { status, body });
            }
            return Err(CrmClientError::HttpError { status, body });
        }

        Err(CrmClientError::MaxRetriesExceeded {
            attempts: self.config.max_retries + 1,
            last_error,
        })
    }
}

#[async_trait]
impl CrmClient for SalesforceClient {
    async fn get_opportunities(&self, query: &OpportunityQuery) -> DealSyncResult<OpportunityPage> {
        let response = self.query(&build_opportunity_soql(query)).await?;
        // LIMIT makes the API report done=true even when more rows follow the cursor.
        let done = response.done && response.records.len() < query.limit as usize;
        Ok(OpportunityPage {
            records: response.records,
            total_size: response.total_size,
            done,
        })
    }

    async fn count_opportunities(&self, query: &OpportunityQuery) -> DealSyncResult<u64> {
        let response = self.query(&build_count_soql(query)).await?;
        Ok(response.total_size)
    }

    async fn get_opportunity_by_id(&self, id: &str) -> DealSyncResult<Option<serde_json::Value>> {
        match self.query(&build_by_id_soql(id)).await {
            Ok(response) => Ok(response.records.into_iter().next()),
            Err(CrmClientError::HttpError { status, .. }) if status == StatusCode::NOT_FOUND => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Builds a [`SalesforceClient`] from each connection's credentials.
#[derive(Debug, Clone)]
pub struct SalesforceClientFactory {
    pub api_version: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl CrmClientFactory for SalesforceClientFactory {
    fn client_for(&self, connection: &Connection) -> DealSyncResult<Arc<dyn CrmClient>> {
        let config = SalesforceClientConfig::from_credentials(
            &connection.credentials,
            &self.api_version,
            self.max_retries,
            self.timeout_secs,
        )?;
        let client = SalesforceClient::new(config)
            .map_err(|e| DealSyncError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Arc::new(client))
    }
}
