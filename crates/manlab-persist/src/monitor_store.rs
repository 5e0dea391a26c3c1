use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manlab_proto::NodeId;
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::PersistResult;

/// A persisted monitor schedule descriptor. The four monitor families
/// (HTTP, Traffic, ScheduledNetworkTool, ServiceMonitor) share this shape;
/// `kind` distinguishes the table.
#[derive(Debug, Clone)]
pub struct MonitorConfigRow {
    pub id: Uuid,
    pub node_id: NodeId,
    pub cron_or_interval: String,
    pub enabled: bool,
    pub params: serde_json::Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MonitorCheckRow {
    pub id: Uuid,
    pub config_id: Uuid,
    pub checked_at: DateTime<Utc>,
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    Http,
    Traffic,
    ScheduledNetworkTool,
    ServiceMonitor,
}

impl MonitorKind {
    fn config_table(self) -> &'static str {
        match self {
            Self::Http => "http_monitor_configs",
            Self::Traffic => "traffic_monitor_configs",
            Self::ScheduledNetworkTool => "scheduled_network_tool_configs",
            Self::ServiceMonitor => "service_monitor_configs",
        }
    }
}

/// Monitor config CRUD plus append-only check/sample history.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn upsert_config(&self, kind: MonitorKind, row: &MonitorConfigRow) -> PersistResult<()>;
    async fn list_enabled_configs(&self, kind: MonitorKind) -> PersistResult<Vec<MonitorConfigRow>>;
    async fn mark_run(
        &self,
        kind: MonitorKind,
        id: Uuid,
        ran_at: DateTime<Utc>,
        succeeded: bool,
    ) -> PersistResult<()>;
    async fn append_http_check(&self, config_id: Uuid, checked_at: DateTime<Utc>, fields: serde_json::Value) -> PersistResult<()>;
    async fn append_traffic_sample(&self, config_id: Uuid, sampled_at: DateTime<Utc>, fields: serde_json::Value) -> PersistResult<()>;
    async fn recent_http_checks(&self, config_id: Uuid, limit: i64) -> PersistResult<Vec<MonitorCheckRow>>;
}

// ─── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgMonitorStore {
    pool: PgPool,
}

impl PgMonitorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: Uuid,
    node_id: Uuid,
    cron_or_interval: String,
    enabled: bool,
    params: serde_json::Value,
    last_run_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl From<ConfigRow> for MonitorConfigRow {
    fn from(r: ConfigRow) -> Self {
        MonitorConfigRow {
            id: r.id,
            node_id: r.node_id,
            cron_or_interval: r.cron_or_interval,
            enabled: r.enabled,
            params: r.params,
            last_run_at: r.last_run_at,
            last_success_at: r.last_success_at,
        }
    }
}

#[async_trait]
impl MonitorStore for PgMonitorStore {
    async fn upsert_config(&self, kind: MonitorKind, row: &MonitorConfigRow) -> PersistResult<()> {
        let table = kind.config_table();
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, node_id, cron_or_interval, enabled, params, last_run_at, last_success_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (id) DO UPDATE SET
                node_id = EXCLUDED.node_id,
                cron_or_interval = EXCLUDED.cron_or_interval,
                enabled = EXCLUDED.enabled,
                params = EXCLUDED.params
            "#
        ))
        .bind(row.id)
        .bind(row.node_id)
        .bind(&row.cron_or_interval)
        .bind(row.enabled)
        .bind(&row.params)
        .bind(row.last_run_at)
        .bind(row.last_success_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_enabled_configs(&self, kind: MonitorKind) -> PersistResult<Vec<MonitorConfigRow>> {
        let table = kind.config_table();
        let rows = sqlx::query_as::<_, ConfigRow>(&format!(
            "SELECT * FROM {table} WHERE enabled = true"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_run(&self, kind: MonitorKind, id: Uuid, ran_at: DateTime<Utc>, succeeded: bool) -> PersistResult<()> {
        let table = kind.config_table();
        if succeeded {
            sqlx::query(&format!(
                "UPDATE {table} SET last_run_at = $1, last_success_at = $1 WHERE id = $2"
            ))
            .bind(ran_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(&format!("UPDATE {table} SET last_run_at = $1 WHERE id = $2"))
                .bind(ran_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn append_http_check(&self, config_id: Uuid, checked_at: DateTime<Utc>, fields: serde_json::Value) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO http_monitor_checks (id, config_id, checked_at, response_time_ms, status_code, keyword_matched, tls_days_remaining, error)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(config_id)
        .bind(checked_at)
        .bind(fields.get("response_time_ms").and_then(|v| v.as_i64()))
        .bind(fields.get("status_code").and_then(|v| v.as_i64()).map(|v| v as i32))
        .bind(fields.get("keyword_matched").and_then(|v| v.as_bool()))
        .bind(fields.get("tls_days_remaining").and_then(|v| v.as_i64()).map(|v| v as i32))
        .bind(fields.get("error").and_then(|v| v.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_traffic_sample(&self, config_id: Uuid, sampled_at: DateTime<Utc>, fields: serde_json::Value) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO traffic_monitor_samples (id, config_id, interface_name, sampled_at, rx_bytes_per_sec, tx_bytes_per_sec, utilization_pct)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(config_id)
        .bind(fields.get("interface_name").and_then(|v| v.as_str()).unwrap_or_default())
        .bind(sampled_at)
        .bind(fields.get("rx_bytes_per_sec").and_then(|v| v.as_f64()))
        .bind(fields.get("tx_bytes_per_sec").and_then(|v| v.as_f64()))
        .bind(fields.get("utilization_pct").and_then(|v| v.as_f64()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_http_checks(&self, config_id: Uuid, limit: i64) -> PersistResult<Vec<MonitorCheckRow>> {
        let rows: Vec<(Uuid, Uuid, DateTime<Utc>, Option<i64>, Option<i32>, Option<bool>, Option<i32>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, config_id, checked_at, response_time_ms, status_code, keyword_matched, tls_days_remaining, error
            FROM http_monitor_checks
            WHERE config_id = $1
            ORDER BY checked_at DESC
            LIMIT $2
            "#,
        )
        .bind(config_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, config_id, checked_at, response_time_ms, status_code, keyword_matched, tls_days_remaining, error)| {
                MonitorCheckRow {
                    id,
                    config_id,
                    checked_at,
                    fields: serde_json::json!({
                        "response_time_ms": response_time_ms,
                        "status_code": status_code,
                        "keyword_matched": keyword_matched,
                        "tls_days_remaining": tls_days_remaining,
                        "error": error,
                    }),
                }
            })
            .collect())
    }
}

// ─── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryMonitorStore {
    configs: Mutex<HashMap<(&'static str, Uuid), MonitorConfigRow>>,
    http_checks: Mutex<Vec<MonitorCheckRow>>,
    traffic_samples: Mutex<Vec<(Uuid, DateTime<Utc>, serde_json::Value)>>,
}

impl InMemoryMonitorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MonitorStore for InMemoryMonitorStore {
    async fn upsert_config(&self, kind: MonitorKind, row: &MonitorConfigRow) -> PersistResult<()> {
        self.configs.lock().insert((kind.config_table(), row.id), row.clone());
        Ok(())
    }

    async fn list_enabled_configs(&self, kind: MonitorKind) -> PersistResult<Vec<MonitorConfigRow>> {
        let table = kind.config_table();
        Ok(self
            .configs
            .lock()
            .iter()
            .filter(|((t, _), row)| *t == table && row.enabled)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn mark_run(&self, kind: MonitorKind, id: Uuid, ran_at: DateTime<Utc>, succeeded: bool) -> PersistResult<()> {
        if let Some(row) = self.configs.lock().get_mut(&(kind.config_table(), id)) {
            row.last_run_at = Some(ran_at);
            if succeeded {
                row.last_success_at = Some(ran_at);
            }
        }
        Ok(())
    }

    async fn append_http_check(&self, config_id: Uuid, checked_at: DateTime<Utc>, fields: serde_json::Value) -> PersistResult<()> {
        self.http_checks.lock().push(MonitorCheckRow {
            id: Uuid::new_v4(),
            config_id,
            checked_at,
            fields,
        });
        Ok(())
    }

    async fn append_traffic_sample(&self, config_id: Uuid, sampled_at: DateTime<Utc>, fields: serde_json::Value) -> PersistResult<()> {
        self.traffic_samples.lock().push((config_id, sampled_at, fields));
        Ok(())
    }

    async fn recent_http_checks(&self, config_id: Uuid, limit: i64) -> PersistResult<Vec<MonitorCheckRow>> {
        let mut checks: Vec<MonitorCheckRow> = self
            .http_checks
            .lock()
            .iter()
            .filter(|c| c.config_id == config_id)
            .cloned()
            .collect();
        checks.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        checks.truncate(limit.max(0) as usize);
        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_list_enabled_configs() {
        let store = InMemoryMonitorStore::new();
        let row = MonitorConfigRow {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            cron_or_interval: "0 */5 * * * *".to_string(),
            enabled: true,
            params: serde_json::json!({"url": "https://example.com"}),
            last_run_at: None,
            last_success_at: None,
        };
        store.upsert_config(MonitorKind::Http, &row).await.unwrap();

        let configs = store.list_enabled_configs(MonitorKind::Http).await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, row.id);
    }

    #[tokio::test]
    async fn mark_run_updates_timestamps() {
        let store = InMemoryMonitorStore::new();
        let row = MonitorConfigRow {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            cron_or_interval: "30s".to_string(),
            enabled: true,
            params: serde_json::json!({}),
            last_run_at: None,
            last_success_at: None,
        };
        store.upsert_config(MonitorKind::ServiceMonitor, &row).await.unwrap();

        let now = Utc::now();
        store.mark_run(MonitorKind::ServiceMonitor, row.id, now, true).await.unwrap();

        let configs = store.list_enabled_configs(MonitorKind::ServiceMonitor).await.unwrap();
        assert_eq!(configs[0].last_run_at, Some(now));
        assert_eq!(configs[0].last_success_at, Some(now));
    }

    #[tokio::test]
    async fn recent_http_checks_are_newest_first_and_capped() {
        let store = InMemoryMonitorStore::new();
        let config_id = Uuid::new_v4();
        let base = Utc::now();
        for i in 0..5 {
            store
                .append_http_check(config_id, base + chrono::Duration::seconds(i), serde_json::json!({"status_code": 200}))
                .await
                .unwrap();
        }

        let checks = store.recent_http_checks(config_id, 3).await.unwrap();
        assert_eq!(checks.len(), 3);
        assert!(checks[0].checked_at > checks[1].checked_at);
    }
}
