use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use dealsync_common::error::{DealSyncError, DealSyncResult};
use dealsync_db::connections::models::{ConnectionSettings, StageAction};
use dealsync_db::deals::models::Deal;

/// Reference to an invoice created downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRef {
    pub invoice_id: String,
    #[serde(default)]
    pub invoice_number: Option<String>,
}

/// Downstream invoice generation. Stage policy is decided before this is called.
#[async_trait]
pub trait InvoiceTrigger: Send + Sync {
    /// Deal-level prerequisites (e.g. a billable amount).
    fn should_generate(&self, deal: &Deal) -> bool;

    async fn generate(&self, deal: &Deal) -> DealSyncResult<InvoiceRef>;
}

/// Stage → action mapping; stages compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StagePolicy {
    actions: HashMap<String, StageAction>,
}

impl StagePolicy {
    /// Every listed stage generates an invoice; anything else is ignored.
    pub fn from_stages(stages: &[String]) -> Self {
        Self {
            actions: stages
                .iter()
                .map(|s| (normalize(s), StageAction::GenerateInvoice))
                .collect(),
        }
    }

    /// The connection's own mapping if it has one, else the global stage list.
    pub fn for_connection(settings: &ConnectionSettings, default_stages: &[String]) -> Self {
        if settings.stage_mappings.is_empty() {
            return Self::from_stages(default_stages);
        }
        Self {
            actions: settings
                .stage_mappings
                .iter()
                .map(|(stage, action)| (normalize(stage), *action))
                .collect(),
        }
    }

    pub fn action_for(&self, stage: &str) -> StageAction {
        self.actions
            .get(&normalize(stage))
            .copied()
            .unwrap_or(StageAction::Ignore)
    }
}

fn normalize(stage: &str) -> String {
    stage.trim().to_lowercase()
}

#[derive(Serialize)]
struct InvoiceRequest<'a> {
    deal_id: uuid::Uuid,
    connection_id: uuid::Uuid,
    external_deal_id: &'a str,
    title: &'a str,
    amount: Option<f64>,
    currency: &'a str,
    stage: &'a str,
    customer: Option<&'a serde_json::Value>,
}

/// Calls the invoice service: `POST {base_url}/invoices`.
#[derive(Clone)]
pub struct HttpInvoiceTrigger {
    client: Client,
    base_url: String,
}

impl HttpInvoiceTrigger {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl InvoiceTrigger for HttpInvoiceTrigger {
    fn should_generate(&self, deal: &Deal) -> bool {
        deal.amount.is_some_and(|amount| amount > 0.0)
    }

    async fn generate(&self, deal: &Deal) -> DealSyncResult<InvoiceRef> {
        let body = InvoiceRequest {
            deal_id: deal.id,
            connection_id: deal.connection_id,
            external_deal_id: &deal.external_deal_id,
            title: &deal.title,
            amount: deal.amount,
            currency: &deal.currency,
            stage: &deal.stage,
            customer: deal.customer_data.as_ref(),
        };

        let response = self
            .client
            .post(format!("{}/invoices", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| DealSyncError::Remote(format!("invoice service: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<InvoiceRef>()
                .await
                .map_err(|e| DealSyncError::Remote(format!("invoice service response: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
            return Err(DealSyncError::Validation(format!(
                "invoice rejected for deal {}: {text}",
                deal.external_deal_id
            )));
        }
        Err(DealSyncError::Remote(format!("invoice service HTTP {status}: {text}")))
    }
}
