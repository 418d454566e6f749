use std::collections::BTreeMap;

use md5::Md5;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use dealsync_config::HashAlgorithm;

/// Top-level fields whose change should trigger a re-sync.
pub const HASHED_FIELDS: &[&str] = &[
    "Name",
    "Amount",
    "StageName",
    "CloseDate",
    "Probability",
    "LastModifiedDate",
    "Description",
];

/// Subset of the nested `Account` object that is hashed.
pub const HASHED_ACCOUNT_FIELDS: &[&str] = &[
    "Name",
    "Industry",
    "BillingCity",
    "BillingCountry",
    "Website",
    "Phone",
];

static NULL: Value = Value::Null;

#[derive(Serialize)]
#[serde(untagged)]
enum HashedValue<'a> {
    Scalar(&'a Value),
    Nested(BTreeMap<&'static str, &'a Value>),
}

/// Content fingerprint over an allow-list of fields.
///
/// Keys are serialized in sorted order, so two records with equal hashed
/// fields hash equally regardless of key order or unrelated fields.
#[derive(Debug, Clone, Copy)]
pub struct RecordHasher {
    algorithm: HashAlgorithm,
}

impl RecordHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Hex digest of the record, or an empty string if the record has an
    /// unexpected shape. An empty hash never matches a cached one.
    pub fn hash(&self, record: &Value) -> String {
        let canonical = match canonical_subset(record).and_then(|subset| {
            serde_json::to_string(&subset).map_err(|e| e.to_string())
        }) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to extract hashable fields");
                return String::new();
            }
        };

        match self.algorithm {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(canonical.as_bytes())),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(canonical.as_bytes())),
        }
    }
}

fn canonical_subset(record: &Value) -> Result<BTreeMap<&'static str, HashedValue<'_>>, String> {
    let obj = record
        .as_object()
        .ok_or_else(|| "record is not an object".to_string())?;

    let mut subset = BTreeMap::new();
    for field in HASHED_FIELDS {
        subset.insert(*field, HashedValue::Scalar(obj.get(*field).unwrap_or(&NULL)));
    }

    let account = match obj.get("Account") {
        None | Some(Value::Null) => HashedValue::Scalar(&NULL),
        Some(Value::Object(account)) => HashedValue::Nested(
            HASHED_ACCOUNT_FIELDS
                .iter()
                .map(|f| (*f, account.get(*f).unwrap_or(&NULL)))
                .collect(),
        ),
        Some(_) => return Err("Account is not an object".to_string()),
    };
    subset.insert("Account", account);

    Ok(subset)
}

/// Whether a freshly computed hash differs from the cached one.
pub fn hash_changed(current: &str, cached: Option<&String>) -> bool {
    current.is_empty() || cached.map(String::as_str) != Some(current)
}
