use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use dealsync_cache::ChangeCache;
use dealsync_common::error::DealSyncResult;
use dealsync_config::SyncSettings;
use dealsync_db::connections::models::Connection;
use dealsync_db::deals::models::{Deal, DealSyncStatus};
use dealsync_db::deals::repositories::DealRepository;

use crate::changes::{classify, ChangeRecord, ChangeType, FieldChange};
use crate::crm::models::{external_id_of, OpportunityQuery};
use crate::crm::{fetch_all, CrmClient};
use crate::hasher::{hash_changed, RecordHasher};

const PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Ignore the cursor and compare everything the CRM returns.
    pub force_full: bool,
    pub stage_names: Vec<String>,
    /// Overrides the configured maximum fetch size.
    pub max_fetch: Option<usize>,
}

/// Output of one detection cycle.
#[derive(Debug, Clone)]
pub struct Detection {
    pub changes: Vec<ChangeRecord>,
    /// Lower bound used for the remote query; `None` for a full comparison.
    pub since: Option<DateTime<Utc>>,
    /// Cursor to persist once the changes have been applied.
    pub next_cursor: DateTime<Utc>,
    pub fetched: usize,
    /// Changes dropped by the per-cycle cap; they are picked up next cycle.
    pub overflow: usize,
}

/// Diffs the remote snapshot against the local store and hash cache.
///
/// Never writes to the deal store. The only side effect is the hash cache,
/// written once at the end of the cycle.
pub struct ChangeDetector {
    deals: Arc<dyn DealRepository>,
    cache: Arc<dyn ChangeCache>,
    hasher: RecordHasher,
    settings: SyncSettings,
}

impl ChangeDetector {
    pub fn new(
        deals: Arc<dyn DealRepository>,
        cache: Arc<dyn ChangeCache>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            deals,
            cache,
            hasher: RecordHasher::new(settings.hash_algorithm),
            settings,
        }
    }

    pub async fn detect(
        &self,
        connection: &Connection,
        crm: &dyn CrmClient,
        options: &DetectOptions,
    ) -> DealSyncResult<Detection> {
        let cycle_start = Utc::now();
        let lookback = Duration::hours(i64::from(
            connection
                .settings
                .lookback_hours
                .unwrap_or(self.settings.lookback_hours),
        ));
        let since = if options.force_full {
            None
        } else {
            Some(self.resolve_since(connection.id, cycle_start - lookback).await)
        };

        let max_fetch = options.max_fetch.unwrap_or(self.settings.max_fetch_size);
        let query = OpportunityQuery {
            limit: PAGE_SIZE,
            modified_since: since,
            stage_names: options.stage_names.clone(),
            ..OpportunityQuery::default()
        };
        let mut remote = fetch_all(crm, query, max_fetch).await?;
        let truncated = remote.len() >= max_fetch;
        let fetched = remote.len();

        let local = self.deals.list_by_connection(connection.id).await?;

        if options.stage_names.is_empty() {
            self.refetch_failed(connection.id, crm, &local, &mut remote)
                .await?;
        }

        let local_by_id: HashMap<&str, &Deal> = local
            .iter()
            .map(|d| (d.external_deal_id.as_str(), d))
            .collect();
        let cached = self.load_hashes(connection.id).await;
        let mut hashes = cached.clone();

        // Each change paired with the hash to commit if it survives the cap.
        let mut candidates: Vec<(ChangeRecord, Option<String>)> = Vec::new();
        let mut remote_ids: HashSet<&str> = HashSet::new();

        for record in &remote {
            let Some(external_id) = external_id_of(record) else {
                tracing::warn!(connection_id = %connection.id, "skipping remote record without Id");
                continue;
            };
            if !remote_ids.insert(external_id) {
                continue;
            }
            let hash = self.hasher.hash(record);

            let change = match local_by_id.get(external_id) {
                None => Some(change_record(
                    external_id,
                    ChangeType::Created,
                    Vec::new(),
                    cycle_start,
                    Some(record),
                )),
                Some(deal) => {
                    let forced = needs_force_update(deal, cycle_start, lookback);
                    if forced || hash_changed(&hash, cached.get(external_id)) {
                        let diffs = diff_fields(deal, record);
                        Some(change_record(
                            external_id,
                            classify(&diffs),
                            diffs,
                            cycle_start,
                            Some(record),
                        ))
                    } else {
                        None
                    }
                }
            };

            if let Some(change) = change {
                candidates.push((change, Some(hash)));
            }
        }

        if self.settings.track_deletions {
            if truncated || !options.stage_names.is_empty() {
                tracing::warn!(
                    connection_id = %connection.id,
                    truncated,
                    "remote snapshot is partial, skipping deletion tracking"
                );
            } else {
                for deal in &local {
                    if deal.sync_status != DealSyncStatus::Deleted
                        && !remote_ids.contains(deal.external_deal_id.as_str())
                    {
                        candidates.push((
                            change_record(
                                &deal.external_deal_id,
                                ChangeType::Deleted,
                                Vec::new(),
                                cycle_start,
                                None,
                            ),
                            None,
                        ));
                    }
                }
            }
        }

        let max_changes = self.settings.max_changes_per_sync;
        let overflow = candidates.len().saturating_sub(max_changes);
        if overflow > 0 {
            tracing::warn!(
                connection_id = %connection.id,
                detected = candidates.len(),
                max_changes,
                overflow,
                "change cap reached, deferring the rest to the next cycle"
            );
            for (change, hash) in candidates.drain(max_changes..) {
                // Forget the hash so the deferred record is detected again.
                if hash.is_some() {
                    hashes.remove(&change.external_id);
                }
            }
        }

        let mut changes = Vec::with_capacity(candidates.len());
        for (change, hash) in candidates {
            match hash {
                Some(h) if !h.is_empty() => {
                    hashes.insert(change.external_id.clone(), h);
                }
                _ => {
                    hashes.remove(&change.external_id);
                }
            }
            changes.push(change);
        }

        self.store_hashes(connection.id, &hashes).await;

        tracing::info!(
            connection_id = %connection.id,
            full = options.force_full,
            fetched,
            local = local.len(),
            changes = changes.len(),
            overflow,
            "change detection finished"
        );

        Ok(Detection {
            changes,
            since,
            next_cursor: cycle_start,
            fetched,
            overflow,
        })
    }

    /// Cursor if one is stored, else the lookback boundary. Cache trouble
    /// degrades to the boundary.
    async fn resolve_since(&self, connection_id: Uuid, fallback: DateTime<Utc>) -> DateTime<Utc> {
        match self.cache.get_cursor(connection_id).await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => fallback,
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "cursor unavailable, using lookback window");
                fallback
            }
        }
    }

    async fn load_hashes(&self, connection_id: Uuid) -> HashMap<String, String> {
        match self.cache.get_hashes(connection_id).await {
            Ok(hashes) => hashes,
            Err(e) => {
                tracing::warn!(%connection_id, error = %e, "hash cache unavailable, treating all records as changed");
                HashMap::new()
            }
        }
    }

    async fn store_hashes(&self, connection_id: Uuid, hashes: &HashMap<String, String>) {
        if let Err(e) = self
            .cache
            .set_hashes(connection_id, hashes, self.settings.cache_ttl())
            .await
        {
            tracing::warn!(%connection_id, error = %e, "failed to persist hash cache");
        }
    }

    /// Deals whose last apply failed are re-read by id when the window missed them.
    async fn refetch_failed(
        &self,
        connection_id: Uuid,
        crm: &dyn CrmClient,
        local: &[Deal],
        remote: &mut Vec<Value>,
    ) -> DealSyncResult<()> {
        let seen: HashSet<String> = remote
            .iter()
            .filter_map(external_id_of)
            .map(str::to_owned)
            .collect();

        for deal in local {
            if deal.sync_status != DealSyncStatus::Failed || seen.contains(&deal.external_deal_id) {
                continue;
            }
            match crm.get_opportunity_by_id(&deal.external_deal_id).await {
                Ok(Some(record)) => remote.push(record),
                Ok(None) => {}
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        %connection_id,
                        external_id = %deal.external_deal_id,
                        error = %e,
                        "failed to re-read failed deal"
                    );
                }
            }
        }
        Ok(())
    }
}

fn change_record(
    external_id: &str,
    change_type: ChangeType,
    changes: Vec<FieldChange>,
    detected_at: DateTime<Utc>,
    record: Option<&Value>,
) -> ChangeRecord {
    ChangeRecord {
        external_id: external_id.to_string(),
        change_type,
        changes,
        detected_at,
        record: record.cloned(),
    }
}

/// Failed or tombstoned deals and deals not synced within the lookback window
/// are re-applied even when their hash is unchanged.
pub fn needs_force_update(deal: &Deal, now: DateTime<Utc>, lookback: Duration) -> bool {
    deal.sync_status != DealSyncStatus::Success || deal.last_sync < now - lookback
}

/// Field-level diff in a fixed order: title, amount, stage, probability.
pub fn diff_fields(deal: &Deal, record: &Value) -> Vec<FieldChange> {
    let mut diffs = Vec::new();
    diff_text(&mut diffs, "title", &deal.title, record.get("Name"));
    diff_number(&mut diffs, "amount", deal.amount, record.get("Amount"));
    diff_text(&mut diffs, "stage", &deal.stage, record.get("StageName"));
    diff_number(&mut diffs, "probability", deal.probability, record.get("Probability"));
    diffs
}

fn diff_text(diffs: &mut Vec<FieldChange>, field: &'static str, old: &str, new: Option<&Value>) {
    let new_text = new.and_then(Value::as_str).map(str::trim);
    if new_text != Some(old) {
        diffs.push(FieldChange {
            field,
            old: json!(old),
            new: new.cloned().unwrap_or(Value::Null),
        });
    }
}

fn diff_number(
    diffs: &mut Vec<FieldChange>,
    field: &'static str,
    old: Option<f64>,
    new: Option<&Value>,
) {
    let new_number = new.and_then(Value::as_f64);
    let differs = match (old, new_number) {
        (Some(a), Some(b)) => (a - b).abs() > f64::EPSILON,
        (None, None) => false,
        _ => true,
    };
    if differs {
        diffs.push(FieldChange {
            field,
            old: json!(old),
            new: json!(new_number),
        });
    }
}
