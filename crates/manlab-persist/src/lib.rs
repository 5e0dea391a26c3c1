//! Postgres-backed persistence for the ManLab hub.
//!
//! `DATABASE_URL` is optional the same way the reference `der_headend`
//! crate treats it: when unset, the hub runs with the in-memory store
//! variants and nothing survives a restart. When set, `init_schema` runs
//! idempotent `CREATE TABLE IF NOT EXISTS` / `ALTER TABLE ... ADD COLUMN IF
//! NOT EXISTS` statements on startup instead of a migration framework —
//! schema changes apply on startup, with no external migration tool in
//! the dependency graph.

#![forbid(unsafe_code)]

mod audit_store;
mod command_store;
mod monitor_store;
mod node_store;
mod session_store;
mod settings_store;
mod telemetry_store;

pub use audit_store::{AuditEventRow, AuditStore, InMemoryAuditStore, PgAuditStore};
pub use command_store::{CommandStore, InMemoryCommandStore, PgCommandStore};
pub use monitor_store::{
    InMemoryMonitorStore, MonitorCheckRow, MonitorConfigRow, MonitorKind, MonitorStore,
    PgMonitorStore,
};
pub use node_store::{InMemoryNodeStore, NodeStore, PgNodeStore};
pub use session_store::{
    FileBrowserPolicyRow, InMemorySessionStore, LogViewerPolicyRow, PgSessionStore, SessionStore,
    TerminalSessionRow, TerminalSessionStatus,
};
pub use settings_store::{InMemorySettingsStore, PgSettingsStore, SettingRow, SettingsStore};
pub use telemetry_store::{
    HistoryBucket, InMemoryTelemetryStore, PgTelemetryStore, RollupGranularity, TelemetryStore,
};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Connect to Postgres if `database_url` is set, running schema init.
/// Returns `None` (in-memory mode) if it is not.
pub async fn connect_optional(database_url: Option<&str>) -> PersistResult<Option<PgPool>> {
    let Some(url) = database_url else {
        warn!("DATABASE_URL not set, running with in-memory persistence only");
        return Ok(None);
    };

    let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
    init_schema(&pool).await?;
    info!("connected to Postgres and applied schema");
    Ok(Some(pool))
}

/// Idempotent schema setup. Safe to run on every startup.
pub async fn init_schema(pool: &PgPool) -> PersistResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id uuid PRIMARY KEY,
            hostname text NOT NULL,
            ip text,
            os text NOT NULL,
            agent_version text NOT NULL,
            last_seen timestamptz NOT NULL,
            status text NOT NULL,
            capabilities jsonb NOT NULL DEFAULT '{}'::jsonb,
            primary_interface text,
            mac text
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS command_queue (
            id uuid PRIMARY KEY,
            node_id uuid NOT NULL,
            command_type text NOT NULL,
            payload jsonb NOT NULL,
            status text NOT NULL,
            created_at timestamptz NOT NULL,
            sent_at timestamptz,
            executed_at timestamptz,
            output_log text NOT NULL DEFAULT '',
            output_truncated boolean NOT NULL DEFAULT false,
            error text
        );
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_command_queue_node ON command_queue (node_id, created_at);",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_samples (
            node_id uuid NOT NULL,
            recorded_at timestamptz NOT NULL,
            sample jsonb NOT NULL,
            PRIMARY KEY (node_id, recorded_at)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_rollups (
            node_id uuid NOT NULL,
            bucket_start timestamptz NOT NULL,
            granularity text NOT NULL,
            metric text NOT NULL,
            avg double precision NOT NULL,
            min double precision NOT NULL,
            max double precision NOT NULL,
            p95 double precision NOT NULL,
            PRIMARY KEY (node_id, bucket_start, granularity, metric)
        );
        "#,
    )
    .execute(pool)
    .await?;

    for table in [
        "service_status_snapshots",
        "smart_drive_snapshots",
        "gpu_snapshots",
        "ups_snapshots",
    ] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                node_id uuid NOT NULL,
                recorded_at timestamptz NOT NULL,
                payload jsonb NOT NULL,
                PRIMARY KEY (node_id, recorded_at)
            );
            "#
        ))
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS http_monitor_configs (
            id uuid PRIMARY KEY,
            node_id uuid NOT NULL,
            cron_or_interval text NOT NULL,
            enabled boolean NOT NULL DEFAULT true,
            params jsonb NOT NULL,
            last_run_at timestamptz,
            last_success_at timestamptz
        );
        CREATE TABLE IF NOT EXISTS http_monitor_checks (
            id uuid PRIMARY KEY,
            config_id uuid NOT NULL,
            checked_at timestamptz NOT NULL,
            response_time_ms bigint,
            status_code int,
            keyword_matched boolean,
            tls_days_remaining int,
            error text
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS traffic_monitor_configs (
            id uuid PRIMARY KEY,
            node_id uuid NOT NULL,
            cron_or_interval text NOT NULL,
            enabled boolean NOT NULL DEFAULT true,
            params jsonb NOT NULL,
            last_run_at timestamptz,
            last_success_at timestamptz
        );
        CREATE TABLE IF NOT EXISTS traffic_monitor_samples (
            id uuid PRIMARY KEY,
            config_id uuid NOT NULL,
            interface_name text NOT NULL,
            sampled_at timestamptz NOT NULL,
            rx_bytes_per_sec double precision,
            tx_bytes_per_sec double precision,
            utilization_pct double precision
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_network_tool_configs (
            id uuid PRIMARY KEY,
            node_id uuid NOT NULL,
            cron_or_interval text NOT NULL,
            enabled boolean NOT NULL DEFAULT true,
            params jsonb NOT NULL,
            last_run_at timestamptz,
            last_success_at timestamptz
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS service_monitor_configs (
            id uuid PRIMARY KEY,
            node_id uuid NOT NULL,
            enabled boolean NOT NULL DEFAULT true,
            params jsonb NOT NULL,
            last_run_at timestamptz,
            last_success_at timestamptz
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log_viewer_policies (
            id uuid PRIMARY KEY,
            display_name text NOT NULL,
            allowed_root text NOT NULL,
            max_bytes_per_request bigint NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_browser_policies (
            id uuid PRIMARY KEY,
            display_name text NOT NULL,
            allowed_root text NOT NULL,
            max_bytes_per_request bigint NOT NULL,
            is_system boolean NOT NULL DEFAULT false
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS terminal_sessions (
            id uuid PRIMARY KEY,
            node_id uuid NOT NULL,
            created_at timestamptz NOT NULL,
            expires_at timestamptz NOT NULL,
            status text NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key text PRIMARY KEY,
            category text NOT NULL,
            value jsonb NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_events (
            id uuid PRIMARY KEY,
            kind text NOT NULL,
            event_name text NOT NULL,
            actor_id text,
            target_id text,
            success boolean NOT NULL,
            data jsonb NOT NULL,
            recorded_at timestamptz NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
