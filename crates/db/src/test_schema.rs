use sqlx::PgPool;

const TABLES: &[&str] = &[
    "create table if not exists crm_connections (
       id uuid primary key,
       organization_id uuid not null,
       credentials jsonb not null default '{}'::jsonb,
       settings jsonb not null default '{}'::jsonb,
       status text not null default 'active',
       last_sync timestamptz,
       last_successful_sync timestamptz,
       total_deals bigint not null default 0,
       total_invoices bigint not null default 0,
       sync_error_count integer not null default 0,
       created_at timestamptz not null default now(),
       updated_at timestamptz not null default now()
     )",
    "create table if not exists deals (
       id uuid primary key,
       connection_id uuid not null,
       external_deal_id text not null,
       title text not null,
       amount double precision,
       currency text not null,
       stage text not null,
       probability double precision,
       customer_data jsonb,
       deal_data jsonb,
       created_at_source timestamptz,
       updated_at_source timestamptz,
       last_sync timestamptz not null,
       sync_status text not null,
       invoice_generated boolean not null default false,
       invoice_data jsonb,
       created_at timestamptz not null default now(),
       updated_at timestamptz not null default now(),
       unique (connection_id, external_deal_id)
     )",
    "create table if not exists batch_jobs (
       id uuid primary key,
       connection_id uuid not null,
       status text not null,
       start_date timestamptz,
       end_date timestamptz,
       stage_names text[] not null default '{}',
       batch_size integer not null,
       total_records bigint not null default 0,
       total_batches bigint not null default 0,
       processed_batches bigint not null default 0,
       processed_records bigint not null default 0,
       created_records bigint not null default 0,
       updated_records bigint not null default 0,
       failed_records bigint not null default 0,
       error_message text,
       created_at timestamptz not null default now(),
       started_at timestamptz,
       completed_at timestamptz,
       updated_at timestamptz not null default now()
     )",
    "create table if not exists task_leases (
       connection_id uuid primary key,
       id uuid not null,
       task_type text not null,
       acquired_at timestamptz not null,
       expires_at timestamptz not null
     )",
];

/// Create the tables the repository tests touch.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
