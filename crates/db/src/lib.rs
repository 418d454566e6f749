pub mod batch;
pub mod connections;
pub mod deals;
pub mod leases;

#[cfg(test)]
mod test_schema;

use dealsync_common::error::{DealSyncError, DealSyncResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a Postgres connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> DealSyncResult<PgPool> {
    tracing::info!("connecting to database");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| DealSyncError::Database(e.to_string()))
}
