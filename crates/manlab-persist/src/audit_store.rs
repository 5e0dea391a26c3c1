use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use crate::PersistResult;

#[derive(Debug, Clone)]
pub struct AuditEventRow {
    pub id: Uuid,
    pub kind: String,
    pub event_name: String,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub success: bool,
    pub data: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only audit trail storage. Records are never mutated or deleted
/// through this trait — only inserted and listed.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: &AuditEventRow) -> PersistResult<()>;
    async fn list_recent(&self, limit: i64) -> PersistResult<Vec<AuditEventRow>>;
    async fn list_for_target(&self, target_id: &str, limit: i64) -> PersistResult<Vec<AuditEventRow>>;
}

// ─── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct Row {
    id: Uuid,
    kind: String,
    event_name: String,
    actor_id: Option<String>,
    target_id: Option<String>,
    success: bool,
    data: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl From<Row> for AuditEventRow {
    fn from(r: Row) -> Self {
        AuditEventRow {
            id: r.id,
            kind: r.kind,
            event_name: r.event_name,
            actor_id: r.actor_id,
            target_id: r.target_id,
            success: r.success,
            data: r.data,
            recorded_at: r.recorded_at,
        }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, event: &AuditEventRow) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, kind, event_name, actor_id, target_id, success, data, recorded_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(event.id)
        .bind(&event.kind)
        .bind(&event.event_name)
        .bind(&event.actor_id)
        .bind(&event.target_id)
        .bind(event.success)
        .bind(&event.data)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> PersistResult<Vec<AuditEventRow>> {
        let rows = sqlx::query_as::<_, Row>(
            "SELECT * FROM audit_events ORDER BY recorded_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_for_target(&self, target_id: &str, limit: i64) -> PersistResult<Vec<AuditEventRow>> {
        let rows = sqlx::query_as::<_, Row>(
            "SELECT * FROM audit_events WHERE target_id = $1 ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(target_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ─── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryAuditStore {
    events: Mutex<Vec<AuditEventRow>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, event: &AuditEventRow) -> PersistResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> PersistResult<Vec<AuditEventRow>> {
        let mut events = self.events.lock().clone();
        events.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn list_for_target(&self, target_id: &str, limit: i64) -> PersistResult<Vec<AuditEventRow>> {
        let mut events: Vec<AuditEventRow> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.target_id.as_deref() == Some(target_id))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }
}
