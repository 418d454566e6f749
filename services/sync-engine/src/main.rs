use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use dealsync_cache::{ChangeCache, MemoryChangeCache, RedisChangeCache};
use dealsync_config::{init_tracing, AppConfig};
use dealsync_db::batch::pg_repository::PgBatchJobRepository;
use dealsync_db::connections::pg_repository::PgConnectionRepository;
use dealsync_db::deals::pg_repository::PgDealRepository;
use dealsync_db::leases::pg_repository::PgTaskLeaseRepository;
use dealsync_engine::crm::SalesforceClientFactory;
use dealsync_engine::invoice::{HttpInvoiceTrigger, InvoiceTrigger};
use dealsync_engine::{Scheduler, SyncEngineDeps, SyncService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_level);
    config.sync.validate().context("invalid sync settings")?;

    tracing::info!(service = "dealsync-engine", "starting");

    let pool = dealsync_db::create_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let cache: Arc<dyn ChangeCache> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisChangeCache::connect(url, None)
                .await
                .context("failed to connect to redis")?,
        ),
        None => {
            tracing::warn!("REDIS_URL not set, change cache is process-local");
            Arc::new(MemoryChangeCache::new())
        }
    };

    let invoices: Option<Arc<dyn InvoiceTrigger>> = match &config.invoice_service_url {
        Some(url) => Some(Arc::new(
            HttpInvoiceTrigger::new(url, config.crm_timeout_secs)
                .context("failed to build invoice client")?,
        )),
        None => {
            tracing::info!("INVOICE_SERVICE_URL not set, invoice generation disabled");
            None
        }
    };

    let connections = Arc::new(PgConnectionRepository::new(pool.clone()));
    let deps = SyncEngineDeps {
        connections: connections.clone(),
        deals: Arc::new(PgDealRepository::new(pool.clone())),
        jobs: Arc::new(PgBatchJobRepository::new(pool.clone())),
        leases: Arc::new(PgTaskLeaseRepository::new(pool)),
        cache,
        crm: Arc::new(SalesforceClientFactory {
            api_version: config.crm_api_version.clone(),
            max_retries: config.crm_max_retries,
            timeout_secs: config.crm_timeout_secs,
        }),
        invoices,
    };

    let service = Arc::new(SyncService::new(deps, config.sync.clone()));
    let scheduler = Scheduler::new(
        service,
        connections,
        Duration::from_secs(config.poll_interval_secs.max(1)),
    );

    tracing::info!(interval_secs = config.poll_interval_secs, "scheduler running");
    tokio::select! {
        _ = scheduler.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
