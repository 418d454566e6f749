use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use dealsync_common::error::{DealSyncError, DealSyncResult, ErrorKind, RecordError};
use dealsync_config::SyncSettings;
use dealsync_db::connections::models::{Connection, StageAction};
use dealsync_db::connections::repositories::ConnectionRepository;
use dealsync_db::deals::models::{Deal, DealSyncStatus};
use dealsync_db::deals::repositories::DealRepository;

use crate::changes::{ChangeRecord, ChangeType};
use crate::crm::models::external_id_of;
use crate::invoice::{InvoiceTrigger, StagePolicy};
use crate::mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Deleted,
    /// Nothing to do, e.g. deleting a deal that was never stored.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub outcome: ApplyOutcome,
    pub invoice_generated: bool,
}

/// Per-outcome counts of one apply run. `errors` is capped; `failed` is not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub invoices_generated: usize,
    /// Failures that may clear up on the next cycle, counted past the error cap.
    pub transient_failed: usize,
    pub errors: Vec<RecordError>,
}

impl BatchResult {
    fn record(&mut self, applied: Applied) {
        self.processed += 1;
        match applied.outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Deleted => self.deleted += 1,
            ApplyOutcome::Skipped => self.skipped += 1,
        }
        if applied.invoice_generated {
            self.invoices_generated += 1;
        }
    }

    fn record_failure(&mut self, external_id: Option<&str>, err: &DealSyncError, max_errors: usize) {
        self.processed += 1;
        self.failed += 1;
        if err.kind() == ErrorKind::Transient {
            self.transient_failed += 1;
        }
        if self.errors.len() < max_errors {
            self.errors.push(RecordError::new(external_id, err));
        }
    }

    pub fn merge(&mut self, other: BatchResult, max_errors: usize) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.invoices_generated += other.invoices_generated;
        self.transient_failed += other.transient_failed;
        let room = max_errors.saturating_sub(self.errors.len());
        self.errors.extend(other.errors.into_iter().take(room));
    }

    /// Whether any failure, reported or not, may clear up on its own.
    pub fn has_transient_failures(&self) -> bool {
        self.transient_failed > 0
    }
}

/// Applies change sets and raw record batches to the deal store.
pub struct SyncManager {
    deals: Arc<dyn DealRepository>,
    connections: Arc<dyn ConnectionRepository>,
    invoices: Option<Arc<dyn InvoiceTrigger>>,
    settings: SyncSettings,
}

impl SyncManager {
    pub fn new(
        deals: Arc<dyn DealRepository>,
        connections: Arc<dyn ConnectionRepository>,
        invoices: Option<Arc<dyn InvoiceTrigger>>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            deals,
            connections,
            invoices,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub async fn apply_change(
        &self,
        connection: &Connection,
        change: &ChangeRecord,
    ) -> DealSyncResult<Applied> {
        match change.change_type {
            ChangeType::Created => {
                let record = change_payload(change)?;
                self.create(connection, record).await
            }
            ChangeType::Updated | ChangeType::StageChanged | ChangeType::AmountChanged => {
                let record = change_payload(change)?;
                match self.update(connection, record).await {
                    Ok(applied) => Ok(applied),
                    Err(e) => {
                        self.flag_failed(connection.id, &change.external_id).await;
                        Err(e)
                    }
                }
            }
            ChangeType::Deleted => self.delete(connection.id, &change.external_id).await,
        }
    }

    /// Apply a detected change set; one failing change never stops the others.
    pub async fn apply_changes(
        &self,
        connection: &Connection,
        changes: &[ChangeRecord],
    ) -> BatchResult {
        self.apply_bounded(connection.id, changes, |change| async move {
            (
                Some(change.external_id.clone()),
                self.apply_change(connection, change).await,
            )
        })
        .await
    }

    /// Upsert a page of raw remote records (batch import path).
    pub async fn apply_records(&self, connection: &Connection, records: &[Value]) -> BatchResult {
        self.apply_bounded(connection.id, records, |record| async move {
            (
                external_id_of(record).map(str::to_owned),
                self.create(connection, record).await,
            )
        })
        .await
    }

    /// Fold a run's outcome into the connection's counters.
    pub async fn record_stats(&self, connection_id: Uuid, failed: usize) -> DealSyncResult<Connection> {
        let connection = self
            .connections
            .record_sync(connection_id, failed, self.settings.disable_after_failures)
            .await?;
        if !connection.is_active() {
            tracing::error!(
                %connection_id,
                sync_error_count = connection.sync_error_count,
                "connection disabled after repeated sync failures"
            );
        }
        Ok(connection)
    }

    /// Fixed-size chunks, each fanned out under a shared concurrency limit,
    /// with a pause between chunks.
    async fn apply_bounded<'a, T, F, Fut>(
        &'a self,
        connection_id: Uuid,
        items: &'a [T],
        apply: F,
    ) -> BatchResult
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = (Option<String>, DealSyncResult<Applied>)> + 'a,
    {
        let mut result = BatchResult::default();
        let semaphore = Semaphore::new(self.settings.max_concurrency.max(1));
        let delay = self.settings.inter_chunk_delay();

        for (index, chunk) in items.chunks(self.settings.chunk_size.max(1)).enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let semaphore = &semaphore;
            let mut in_flight: FuturesUnordered<_> = chunk
                .iter()
                .map(|item| {
                    let work = apply(item);
                    async move {
                        let _permit = semaphore.acquire().await;
                        work.await
                    }
                })
                .collect();

            while let Some((external_id, outcome)) = in_flight.next().await {
                match outcome {
                    Ok(applied) => result.record(applied),
                    Err(e) => {
                        tracing::warn!(
                            %connection_id,
                            external_id = external_id.as_deref().unwrap_or("<unknown>"),
                            kind = e.kind().as_str(),
                            error = %e,
                            "failed to apply record"
                        );
                        result.record_failure(
                            external_id.as_deref(),
                            &e,
                            self.settings.max_reported_errors,
                        );
                    }
                }
            }
        }

        result
    }

    /// Insert-or-update by external id.
    async fn create(&self, connection: &Connection, record: &Value) -> DealSyncResult<Applied> {
        let fields = mapping::to_deal_fields(record)?;
        let deal = mapping::new_deal(connection.id, fields, Utc::now());
        self.persist(connection, deal).await
    }

    /// Overwrite an existing deal, or create it if the create was missed.
    async fn update(&self, connection: &Connection, record: &Value) -> DealSyncResult<Applied> {
        let fields = mapping::to_deal_fields(record)?;
        let now = Utc::now();
        let deal = match self
            .deals
            .get_by_external_id(connection.id, &fields.external_deal_id)
            .await?
        {
            Some(existing) => mapping::apply_fields(existing, fields, now),
            None => {
                tracing::debug!(
                    connection_id = %connection.id,
                    external_id = %fields.external_deal_id,
                    "update for unknown deal, creating it"
                );
                mapping::new_deal(connection.id, fields, now)
            }
        };
        self.persist(connection, deal).await
    }

    async fn delete(&self, connection_id: Uuid, external_id: &str) -> DealSyncResult<Applied> {
        let outcome = match self
            .deals
            .mark_deleted(connection_id, external_id, Utc::now())
            .await?
        {
            Some(_) => ApplyOutcome::Deleted,
            None => ApplyOutcome::Skipped,
        };
        Ok(Applied {
            outcome,
            invoice_generated: false,
        })
    }

    async fn persist(&self, connection: &Connection, deal: Deal) -> DealSyncResult<Applied> {
        let upserted = self.deals.upsert(deal).await?;
        let outcome = if upserted.inserted {
            ApplyOutcome::Created
        } else {
            ApplyOutcome::Updated
        };
        let invoice_generated = self.maybe_generate_invoice(connection, &upserted.deal).await;
        Ok(Applied {
            outcome,
            invoice_generated,
        })
    }

    async fn flag_failed(&self, connection_id: Uuid, external_id: &str) {
        if let Err(e) = self
            .deals
            .mark_failed(connection_id, external_id, Utc::now())
            .await
        {
            tracing::warn!(%connection_id, external_id, error = %e, "failed to flag deal for retry");
        }
    }

    /// Claim, generate, complete. A generation failure releases the claim and
    /// leaves the deal upsert in place.
    async fn maybe_generate_invoice(&self, connection: &Connection, deal: &Deal) -> bool {
        if !self.settings.auto_generate_invoices
            || deal.invoice_generated
            || deal.sync_status != DealSyncStatus::Success
        {
            return false;
        }
        let Some(trigger) = &self.invoices else {
            return false;
        };
        let policy = StagePolicy::for_connection(&connection.settings, &self.settings.invoice_stages);
        if policy.action_for(&deal.stage) != StageAction::GenerateInvoice
            || !trigger.should_generate(deal)
        {
            return false;
        }

        match self.deals.claim_invoice(deal.id).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::warn!(deal_id = %deal.id, error = %e, "failed to claim deal for invoicing");
                return false;
            }
        }

        match trigger.generate(deal).await {
            Ok(invoice) => {
                let data = json!({
                    "invoice_id": invoice.invoice_id,
                    "invoice_number": invoice.invoice_number,
                    "generated_at": Utc::now(),
                });
                if let Err(e) = self.deals.complete_invoice(deal.id, data).await {
                    tracing::warn!(deal_id = %deal.id, error = %e, "failed to store invoice reference");
                }
                if let Err(e) = self.connections.add_invoices(connection.id, 1).await {
                    tracing::warn!(connection_id = %connection.id, error = %e, "failed to count invoice");
                }
                tracing::info!(
                    connection_id = %connection.id,
                    external_id = %deal.external_deal_id,
                    invoice_id = %invoice.invoice_id,
                    "invoice generated"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection.id,
                    external_id = %deal.external_deal_id,
                    error = %e,
                    "invoice generation failed"
                );
                if let Err(e) = self.deals.release_invoice_claim(deal.id).await {
                    tracing::warn!(deal_id = %deal.id, error = %e, "failed to release invoice claim");
                }
                false
            }
        }
    }
}

fn change_payload(change: &ChangeRecord) -> DealSyncResult<&Value> {
    change.record.as_ref().ok_or_else(|| {
        DealSyncError::Internal(format!(
            "{} change for {} carries no record",
            change.change_type.as_str(),
            change.external_id
        ))
    })
}
