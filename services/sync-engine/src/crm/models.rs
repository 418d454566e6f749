use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use dealsync_common::error::{DealSyncError, DealSyncResult};

/// Bumped whenever the fields below change meaning; stored in `deal_data`.
pub const OPPORTUNITY_SCHEMA_VERSION: u32 = 1;

/// Fields requested from the CRM for every opportunity.
pub const OPPORTUNITY_FIELDS: &[&str] = &[
    "Id",
    "Name",
    "Amount",
    "CurrencyIsoCode",
    "StageName",
    "Probability",
    "CloseDate",
    "CreatedDate",
    "LastModifiedDate",
    "Description",
    "Account.Id",
    "Account.Name",
    "Account.Industry",
    "Account.BillingCity",
    "Account.BillingCountry",
    "Account.Website",
    "Account.Phone",
];

/// Typed view of a remote opportunity record.
///
/// `Id`, `Name` and `StageName` are required; a record missing any of them is
/// rejected rather than defaulted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Opportunity {
    pub id: String,
    pub name: String,
    pub stage_name: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub currency_iso_code: Option<String>,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub close_date: Option<String>,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub last_modified_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub account: Option<AccountRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AccountRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub billing_city: Option<String>,
    #[serde(default)]
    pub billing_country: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Opportunity {
    pub fn from_record(record: &serde_json::Value) -> DealSyncResult<Self> {
        let opp: Self = serde_json::from_value(record.clone()).map_err(|e| {
            DealSyncError::Validation(format!(
                "opportunity {}: {e}",
                external_id_of(record).unwrap_or("<no Id>")
            ))
        })?;

        for (field, value) in [
            ("Id", &opp.id),
            ("Name", &opp.name),
            ("StageName", &opp.stage_name),
        ] {
            if value.trim().is_empty() {
                return Err(DealSyncError::Validation(format!(
                    "opportunity {}: {field} is empty",
                    opp.id
                )));
            }
        }
        if let Some(p) = opp.probability {
            if !(0.0..=100.0).contains(&p) {
                return Err(DealSyncError::Validation(format!(
                    "opportunity {}: probability {p} out of range",
                    opp.id
                )));
            }
        }
        Ok(opp)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified_date.as_deref().and_then(parse_crm_datetime)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created_date.as_deref().and_then(parse_crm_datetime)
    }
}

/// The external id of a raw record, if it has a usable one.
pub fn external_id_of(record: &serde_json::Value) -> Option<&str> {
    record
        .get("Id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Parse CRM timestamps: RFC 3339, or the `2026-02-20T15:00:00.000+0000` form.
pub fn parse_crm_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// One page of opportunity records.
#[derive(Debug, Clone, Default)]
pub struct OpportunityPage {
    pub records: Vec<serde_json::Value>,
    pub total_size: u64,
    pub done: bool,
}

/// Filter + keyset cursor for opportunity queries. Results are ordered by `Id`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpportunityQuery {
    pub limit: u32,
    pub modified_since: Option<DateTime<Utc>>,
    pub modified_until: Option<DateTime<Utc>>,
    pub stage_names: Vec<String>,
    pub after_id: Option<String>,
}

impl Default for OpportunityQuery {
    fn default() -> Self {
        Self {
            limit: 200,
            modified_since: None,
            modified_until: None,
            stage_names: Vec::new(),
            after_id: None,
        }
    }
}
