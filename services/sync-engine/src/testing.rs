//! In-memory fakes shared by the engine's unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use dealsync_cache::{ChangeCache, MemoryChangeCache};
use dealsync_common::error::{DealSyncError, DealSyncResult};
use dealsync_config::SyncSettings;
use dealsync_db::batch::models::{BatchJob, BatchJobStatus, BatchProgress};
use dealsync_db::batch::repositories::BatchJobRepository;
use dealsync_db::connections::models::{Connection, ConnectionSettings, ConnectionStatus};
use dealsync_db::connections::repositories::ConnectionRepository;
use dealsync_db::deals::models::{Deal, DealSyncStatus, UpsertedDeal};
use dealsync_db::deals::repositories::DealRepository;
use dealsync_db::leases::models::{TaskLease, TaskType};
use dealsync_db::leases::repositories::TaskLeaseRepository;

use crate::batch::BatchOrchestrator;
use crate::crm::models::external_id_of;
use crate::crm::{CrmClient, CrmClientFactory, OpportunityPage, OpportunityQuery};
use crate::invoice::{InvoiceRef, InvoiceTrigger};
use crate::manager::SyncManager;
use crate::mapping;
use crate::service::{SyncEngineDeps, SyncService};

// ── Fixtures ────────────────────────────────────────────────

pub fn opportunity(id: &str, stage: &str, amount: Option<f64>) -> Value {
    json!({
        "Id": id,
        "Name": format!("Deal {id}"),
        "Amount": amount,
        "CurrencyIsoCode": "USD",
        "StageName": stage,
        "Probability": 50,
        "CloseDate": "2026-03-31",
        "CreatedDate": "2026-01-05T09:00:00.000+0000",
        "LastModifiedDate": "2026-02-20T15:00:00.000+0000",
        "Account": { "Name": "Acme" }
    })
}

pub fn connection() -> Connection {
    let now = Utc::now();
    Connection {
        id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
        credentials: json!({
            "instance_url": "https://example.my.salesforce.com",
            "access_token": "test-token"
        }),
        settings: ConnectionSettings::default(),
        status: ConnectionStatus::Active,
        last_sync: None,
        last_successful_sync: None,
        total_deals: 0,
        total_invoices: 0,
        sync_error_count: 0,
        created_at: now,
        updated_at: now,
    }
}

/// A freshly synced local deal for `record`.
pub fn deal_for(connection_id: Uuid, record: &Value) -> Deal {
    let fields = mapping::to_deal_fields(record).expect("fixture record should map");
    mapping::new_deal(connection_id, fields, Utc::now())
}

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        inter_chunk_delay_ms: 0,
        ..SyncSettings::default()
    }
}

// ── Mock DealRepository ─────────────────────────────────────

#[derive(Default)]
pub struct MockDealRepo {
    deals: Mutex<HashMap<(Uuid, String), Deal>>,
    failing: Mutex<HashSet<String>>,
    upsert_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockDealRepo {
    pub fn insert(&self, deal: Deal) {
        self.deals
            .lock()
            .unwrap()
            .insert((deal.connection_id, deal.external_deal_id.clone()), deal);
    }

    pub fn get(&self, connection_id: Uuid, external_id: &str) -> Option<Deal> {
        self.deals
            .lock()
            .unwrap()
            .get(&(connection_id, external_id.to_string()))
            .cloned()
    }

    pub fn all(&self, connection_id: Uuid) -> Vec<Deal> {
        let mut deals: Vec<Deal> = self
            .deals
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.connection_id == connection_id)
            .cloned()
            .collect();
        deals.sort_by(|a, b| a.external_deal_id.cmp(&b.external_deal_id));
        deals
    }

    /// Every upsert of this external id fails with a database error.
    pub fn fail_upsert(&self, external_id: &str) {
        self.failing.lock().unwrap().insert(external_id.to_string());
    }

    pub fn set_upsert_delay(&self, delay: Duration) {
        *self.upsert_delay.lock().unwrap() = Some(delay);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn with_deal<T>(&self, deal_id: Uuid, f: impl FnOnce(&mut Deal) -> T) -> Option<T> {
        self.deals
            .lock()
            .unwrap()
            .values_mut()
            .find(|d| d.id == deal_id)
            .map(f)
    }
}

#[async_trait]
impl DealRepository for MockDealRepo {
    async fn get_by_external_id(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
    ) -> DealSyncResult<Option<Deal>> {
        Ok(self.get(connection_id, external_deal_id))
    }

    async fn list_by_connection(&self, connection_id: Uuid) -> DealSyncResult<Vec<Deal>> {
        Ok(self.all(connection_id))
    }

    async fn upsert(&self, deal: Deal) -> DealSyncResult<UpsertedDeal> {
        let delay = *self.upsert_delay.lock().unwrap();
        if let Some(delay) = delay {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if self.failing.lock().unwrap().contains(&deal.external_deal_id) {
            return Err(DealSyncError::Database(format!(
                "simulated write failure for {}",
                deal.external_deal_id
            )));
        }

        let key = (deal.connection_id, deal.external_deal_id.clone());
        let mut deals = self.deals.lock().unwrap();
        let (stored, inserted) = match deals.get(&key) {
            Some(existing) => (
                Deal {
                    id: existing.id,
                    created_at: existing.created_at,
                    invoice_generated: existing.invoice_generated,
                    invoice_data: existing.invoice_data.clone(),
                    ..deal
                },
                false,
            ),
            None => (deal, true),
        };
        deals.insert(key, stored.clone());
        Ok(UpsertedDeal {
            deal: stored,
            inserted,
        })
    }

    async fn mark_deleted(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
        at: DateTime<Utc>,
    ) -> DealSyncResult<Option<Deal>> {
        let mut deals = self.deals.lock().unwrap();
        Ok(deals
            .get_mut(&(connection_id, external_deal_id.to_string()))
            .map(|d| {
                d.sync_status = DealSyncStatus::Deleted;
                d.last_sync = at;
                d.updated_at = at;
                d.clone()
            }))
    }

    async fn mark_failed(
        &self,
        connection_id: Uuid,
        external_deal_id: &str,
        at: DateTime<Utc>,
    ) -> DealSyncResult<bool> {
        let mut deals = self.deals.lock().unwrap();
        match deals.get_mut(&(connection_id, external_deal_id.to_string())) {
            Some(d) if d.sync_status != DealSyncStatus::Deleted => {
                d.sync_status = DealSyncStatus::Failed;
                d.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_invoice(&self, deal_id: Uuid) -> DealSyncResult<bool> {
        Ok(self
            .with_deal(deal_id, |d| {
                if d.invoice_generated {
                    false
                } else {
                    d.invoice_generated = true;
                    true
                }
            })
            .unwrap_or(false))
    }

    async fn complete_invoice(&self, deal_id: Uuid, invoice_data: Value) -> DealSyncResult<()> {
        self.with_deal(deal_id, |d| d.invoice_data = Some(invoice_data));
        Ok(())
    }

    async fn release_invoice_claim(&self, deal_id: Uuid) -> DealSyncResult<()> {
        self.with_deal(deal_id, |d| {
            d.invoice_generated = false;
            d.invoice_data = None;
        });
        Ok(())
    }
}

// ── Mock ConnectionRepository ───────────────────────────────

#[derive(Default)]
pub struct MockConnectionRepo {
    connections: Mutex<HashMap<Uuid, Connection>>,
}

impl MockConnectionRepo {
    pub fn insert(&self, connection: Connection) {
        self.connections
            .lock()
            .unwrap()
            .insert(connection.id, connection);
    }

    pub fn snapshot(&self, id: Uuid) -> Connection {
        self.connections
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("connection should exist")
    }
}

#[async_trait]
impl ConnectionRepository for MockConnectionRepo {
    async fn get(&self, id: Uuid) -> DealSyncResult<Option<Connection>> {
        Ok(self.connections.lock().unwrap().get(&id).cloned())
    }

    async fn list_active(&self) -> DealSyncResult<Vec<Connection>> {
        let mut active: Vec<Connection> = self
            .connections
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|c| c.created_at);
        Ok(active)
    }

    async fn record_sync(
        &self,
        id: Uuid,
        failed: usize,
        disable_after: i32,
    ) -> DealSyncResult<Connection> {
        let mut connections = self.connections.lock().unwrap();
        let conn = connections
            .get_mut(&id)
            .ok_or_else(|| DealSyncError::NotFound(format!("connection {id}")))?;
        let now = Utc::now();
        conn.last_sync = Some(now);
        conn.updated_at = now;
        if failed == 0 {
            conn.last_successful_sync = Some(now);
            conn.sync_error_count = 0;
        } else {
            if conn.sync_error_count + 1 >= disable_after {
                conn.status = ConnectionStatus::Error;
            }
            conn.sync_error_count += 1;
        }
        Ok(conn.clone())
    }

    async fn add_invoices(&self, id: Uuid, count: i64) -> DealSyncResult<()> {
        if let Some(conn) = self.connections.lock().unwrap().get_mut(&id) {
            conn.total_invoices += count;
        }
        Ok(())
    }
}

// ── Mock TaskLeaseRepository ────────────────────────────────

#[derive(Default)]
pub struct MockLeaseRepo {
    leases: Mutex<HashMap<Uuid, TaskLease>>,
    renewals: Mutex<usize>,
    lost_after: Mutex<Option<usize>>,
}

impl MockLeaseRepo {
    /// The connection's unexpired lease, if any.
    pub fn active(&self, connection_id: Uuid) -> Option<TaskLease> {
        self.leases
            .lock()
            .unwrap()
            .get(&connection_id)
            .filter(|l| !l.is_expired(Utc::now()))
            .cloned()
    }

    /// Successful renewals so far.
    pub fn renewals(&self) -> usize {
        *self.renewals.lock().unwrap()
    }

    /// Report every lease as lost once `n` renewals have succeeded.
    pub fn lose_after_renewals(&self, n: usize) {
        *self.lost_after.lock().unwrap() = Some(n);
    }
}

#[async_trait]
impl TaskLeaseRepository for MockLeaseRepo {
    async fn try_acquire(
        &self,
        connection_id: Uuid,
        task_type: TaskType,
        ttl: chrono::Duration,
    ) -> DealSyncResult<Option<TaskLease>> {
        let now = Utc::now();
        let mut leases = self.leases.lock().unwrap();
        if leases.get(&connection_id).is_some_and(|l| !l.is_expired(now)) {
            return Ok(None);
        }
        let lease = TaskLease {
            id: Uuid::new_v4(),
            connection_id,
            task_type,
            acquired_at: now,
            expires_at: now + ttl,
        };
        leases.insert(connection_id, lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease_id: Uuid, ttl: chrono::Duration) -> DealSyncResult<bool> {
        let mut renewals = self.renewals.lock().unwrap();
        if self.lost_after.lock().unwrap().is_some_and(|n| *renewals >= n) {
            return Ok(false);
        }
        let mut leases = self.leases.lock().unwrap();
        match leases.values_mut().find(|l| l.id == lease_id) {
            Some(lease) => {
                lease.expires_at = Utc::now() + ttl;
                *renewals += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, lease_id: Uuid) -> DealSyncResult<()> {
        self.leases.lock().unwrap().retain(|_, l| l.id != lease_id);
        Ok(())
    }

    async fn get_active(&self, connection_id: Uuid) -> DealSyncResult<Option<TaskLease>> {
        Ok(self.active(connection_id))
    }
}

// ── Mock BatchJobRepository ─────────────────────────────────

#[derive(Default)]
pub struct MockJobRepo {
    jobs: Mutex<HashMap<Uuid, BatchJob>>,
}

impl MockJobRepo {
    /// Overwrite a job's status behind the orchestrator's back.
    pub fn set_status(&self, job_id: Uuid, status: BatchJobStatus) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.status = status;
        }
    }
}

#[async_trait]
impl BatchJobRepository for MockJobRepo {
    async fn create(&self, job: BatchJob) -> DealSyncResult<BatchJob> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> DealSyncResult<Option<BatchJob>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn list_by_connection(
        &self,
        connection_id: Uuid,
        limit: i64,
    ) -> DealSyncResult<Vec<BatchJob>> {
        let mut jobs: Vec<BatchJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.connection_id == connection_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BatchJobStatus],
        to: BatchJobStatus,
        error_message: Option<&str>,
    ) -> DealSyncResult<Option<BatchJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id).filter(|j| from.contains(&j.status)) else {
            return Ok(None);
        };
        let now = Utc::now();
        job.status = to;
        job.error_message = error_message.map(str::to_owned);
        if to == BatchJobStatus::Running {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn record_progress(&self, id: Uuid, progress: BatchProgress) -> DealSyncResult<BatchJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| DealSyncError::NotFound(format!("batch job {id}")))?;
        job.processed_batches += 1;
        job.processed_records += progress.records;
        job.created_records += progress.created;
        job.updated_records += progress.updated;
        job.failed_records += progress.failed;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn reset_for_retry(&self, id: Uuid) -> DealSyncResult<Option<BatchJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs
            .get_mut(&id)
            .filter(|j| j.status == BatchJobStatus::Failed)
        else {
            return Ok(None);
        };
        job.status = BatchJobStatus::Pending;
        job.error_message = None;
        job.processed_batches = 0;
        job.processed_records = 0;
        job.created_records = 0;
        job.updated_records = 0;
        job.failed_records = 0;
        job.started_at = None;
        job.completed_at = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }
}

// ── Mock CrmClient ──────────────────────────────────────────

type PageHook = Box<dyn FnMut(usize) + Send>;

#[derive(Default)]
struct CrmState {
    queries: Vec<OpportunityQuery>,
    auth_failure: bool,
    fail_on: Option<usize>,
    on_page: Option<PageHook>,
}

/// Serves a fixed record set with `Id` keyset paging.
pub struct MockCrm {
    records: Vec<Value>,
    lookup: Vec<Value>,
    state: Mutex<CrmState>,
}

impl MockCrm {
    pub fn new(mut records: Vec<Value>) -> Self {
        records.sort_by(|a, b| external_id_of(a).cmp(&external_id_of(b)));
        Self {
            records,
            lookup: Vec::new(),
            state: Mutex::new(CrmState::default()),
        }
    }

    /// Records only reachable through the by-id lookup.
    pub fn with_lookup(mut self, records: Vec<Value>) -> Self {
        self.lookup = records;
        self
    }

    pub fn page_calls(&self) -> usize {
        self.state.lock().unwrap().queries.len()
    }

    pub fn last_query(&self) -> Option<OpportunityQuery> {
        self.state.lock().unwrap().queries.last().cloned()
    }

    pub fn fail_with_auth(&self) {
        self.state.lock().unwrap().auth_failure = true;
    }

    /// The page request with this zero-based index fails once.
    pub fn fail_on_call(&self, call: usize) {
        self.state.lock().unwrap().fail_on = Some(call);
    }

    /// Run `hook` with the zero-based index of each page request.
    pub fn on_page(&self, hook: impl FnMut(usize) + Send + 'static) {
        self.state.lock().unwrap().on_page = Some(Box::new(hook));
    }

    fn matching<'a>(&'a self, query: &'a OpportunityQuery) -> impl Iterator<Item = &'a Value> + 'a {
        self.records.iter().filter(move |r| {
            let stage_ok = query.stage_names.is_empty()
                || r["StageName"]
                    .as_str()
                    .is_some_and(|s| query.stage_names.iter().any(|n| n == s));
            let after_ok = match (&query.after_id, external_id_of(r)) {
                (Some(after), Some(id)) => id > after.as_str(),
                _ => true,
            };
            stage_ok && after_ok
        })
    }

    fn check_auth(&self) -> DealSyncResult<()> {
        if self.state.lock().unwrap().auth_failure {
            return Err(DealSyncError::Auth("session expired".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CrmClient for MockCrm {
    async fn get_opportunities(&self, query: &OpportunityQuery) -> DealSyncResult<OpportunityPage> {
        {
            let mut state = self.state.lock().unwrap();
            let call = state.queries.len();
            state.queries.push(query.clone());
            if state.auth_failure {
                return Err(DealSyncError::Auth("session expired".into()));
            }
            if let Some(hook) = state.on_page.as_mut() {
                hook(call);
            }
            if state.fail_on == Some(call) {
                state.fail_on = None;
                return Err(DealSyncError::Remote("CRM returned 503".into()));
            }
        }

        let matching: Vec<&Value> = self.matching(query).collect();
        let limit = query.limit as usize;
        Ok(OpportunityPage {
            records: matching.iter().take(limit).map(|r| (*r).clone()).collect(),
            total_size: matching.len() as u64,
            done: matching.len() <= limit,
        })
    }

    async fn count_opportunities(&self, query: &OpportunityQuery) -> DealSyncResult<u64> {
        self.check_auth()?;
        let unpaged = OpportunityQuery {
            after_id: None,
            ..query.clone()
        };
        Ok(self.matching(&unpaged).count() as u64)
    }

    async fn get_opportunity_by_id(&self, id: &str) -> DealSyncResult<Option<Value>> {
        self.check_auth()?;
        Ok(self
            .lookup
            .iter()
            .chain(self.records.iter())
            .find(|r| external_id_of(r) == Some(id))
            .cloned())
    }
}

pub struct MockCrmFactory {
    crm: Arc<MockCrm>,
}

impl CrmClientFactory for MockCrmFactory {
    fn client_for(&self, _connection: &Connection) -> DealSyncResult<Arc<dyn CrmClient>> {
        Ok(self.crm.clone())
    }
}

// ── Mock InvoiceTrigger ─────────────────────────────────────

#[derive(Default)]
pub struct MockInvoiceTrigger {
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl MockInvoiceTrigger {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InvoiceTrigger for MockInvoiceTrigger {
    fn should_generate(&self, _deal: &Deal) -> bool {
        true
    }

    async fn generate(&self, deal: &Deal) -> DealSyncResult<InvoiceRef> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DealSyncError::Remote("invoice service unavailable".into()));
        }
        Ok(InvoiceRef {
            invoice_id: format!("inv-{}", deal.external_deal_id),
            invoice_number: None,
        })
    }
}

// ── Failing ChangeCache ─────────────────────────────────────

pub struct FailingCache;

fn cache_down() -> DealSyncError {
    DealSyncError::Cache("cache offline".into())
}

#[async_trait]
impl ChangeCache for FailingCache {
    async fn get_hashes(&self, _connection_id: Uuid) -> DealSyncResult<HashMap<String, String>> {
        Err(cache_down())
    }

    async fn set_hashes(
        &self,
        _connection_id: Uuid,
        _hashes: &HashMap<String, String>,
        _ttl: Duration,
    ) -> DealSyncResult<()> {
        Err(cache_down())
    }

    async fn get_cursor(&self, _connection_id: Uuid) -> DealSyncResult<Option<DateTime<Utc>>> {
        Err(cache_down())
    }

    async fn set_cursor(&self, _connection_id: Uuid, _cursor: DateTime<Utc>) -> DealSyncResult<()> {
        Err(cache_down())
    }

    async fn clear(&self, _connection_id: Uuid) -> DealSyncResult<()> {
        Err(cache_down())
    }
}

// ── Harness ─────────────────────────────────────────────────

/// One active connection wired to in-memory collaborators.
pub struct Harness {
    pub connection: Connection,
    pub connections: Arc<MockConnectionRepo>,
    pub deals: Arc<MockDealRepo>,
    pub jobs: Arc<MockJobRepo>,
    pub leases: Arc<MockLeaseRepo>,
    pub cache: Arc<MemoryChangeCache>,
    pub crm: Arc<MockCrm>,
    pub invoices: Arc<MockInvoiceTrigger>,
    pub settings: SyncSettings,
}

impl Harness {
    pub fn new(records: Vec<Value>) -> Self {
        Self::with_settings(records, test_settings())
    }

    pub fn with_settings(records: Vec<Value>, settings: SyncSettings) -> Self {
        let connection = connection();
        let connections = Arc::new(MockConnectionRepo::default());
        connections.insert(connection.clone());
        Self {
            connection,
            connections,
            deals: Arc::new(MockDealRepo::default()),
            jobs: Arc::new(MockJobRepo::default()),
            leases: Arc::new(MockLeaseRepo::default()),
            cache: Arc::new(MemoryChangeCache::new()),
            crm: Arc::new(MockCrm::new(records)),
            invoices: Arc::new(MockInvoiceTrigger::default()),
            settings,
        }
    }

    /// Store `record` as an already synced local deal.
    pub fn seed(&self, record: &Value) {
        self.deals.insert(deal_for(self.connection.id, record));
    }

    pub fn deps(&self) -> SyncEngineDeps {
        SyncEngineDeps {
            connections: self.connections.clone(),
            deals: self.deals.clone(),
            jobs: self.jobs.clone(),
            leases: self.leases.clone(),
            cache: self.cache.clone(),
            crm: Arc::new(MockCrmFactory {
                crm: self.crm.clone(),
            }),
            invoices: Some(self.invoices.clone()),
        }
    }

    pub fn orchestrator(&self) -> Arc<BatchOrchestrator> {
        let deps = self.deps();
        let manager = Arc::new(SyncManager::new(
            deps.deals,
            deps.connections.clone(),
            deps.invoices,
            self.settings.clone(),
        ));
        Arc::new(BatchOrchestrator::new(
            deps.connections,
            deps.jobs,
            deps.leases,
            deps.crm,
            manager,
            self.settings.clone(),
        ))
    }

    pub fn service(&self) -> SyncService {
        SyncService::new(self.deps(), self.settings.clone())
    }
}
