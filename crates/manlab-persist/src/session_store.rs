use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manlab_proto::{NodeId, SessionId};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::PersistResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSessionStatus {
    Active,
    Closed,
    Expired,
}

impl TerminalSessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "closed" => Self::Closed,
            _ => Self::Expired,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminalSessionRow {
    pub id: SessionId,
    pub node_id: NodeId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TerminalSessionStatus,
}

/// A named allowlist entry for the log viewer.
/// Requests outside `allowed_root` are rejected before the agent ever sees
/// a path — the policy is enforced hub-side, not trusted to the agent.
#[derive(Debug, Clone)]
pub struct LogViewerPolicyRow {
    pub id: Uuid,
    pub display_name: String,
    pub allowed_root: String,
    pub max_bytes_per_request: i64,
}

#[derive(Debug, Clone)]
pub struct FileBrowserPolicyRow {
    pub id: Uuid,
    pub display_name: String,
    pub allowed_root: String,
    pub max_bytes_per_request: i64,
    pub is_system: bool,
}

/// Persistence for terminal sessions plus the log-viewer and file-browser
/// policy allowlists that gate those session kinds.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_terminal_session(&self, row: &TerminalSessionRow) -> PersistResult<()>;
    async fn get_terminal_session(&self, id: SessionId) -> PersistResult<Option<TerminalSessionRow>>;
    async fn set_terminal_session_status(&self, id: SessionId, status: TerminalSessionStatus) -> PersistResult<()>;
    async fn list_expired_terminal_sessions(&self, now: DateTime<Utc>) -> PersistResult<Vec<SessionId>>;

    async fn upsert_log_viewer_policy(&self, row: &LogViewerPolicyRow) -> PersistResult<()>;
    async fn list_log_viewer_policies(&self) -> PersistResult<Vec<LogViewerPolicyRow>>;
    async fn delete_log_viewer_policy(&self, id: Uuid) -> PersistResult<()>;

    async fn upsert_file_browser_policy(&self, row: &FileBrowserPolicyRow) -> PersistResult<()>;
    async fn list_file_browser_policies(&self) -> PersistResult<Vec<FileBrowserPolicyRow>>;
    async fn delete_file_browser_policy(&self, id: Uuid) -> PersistResult<()>;
}

// ─── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TerminalRow {
    id: Uuid,
    node_id: Uuid,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    status: String,
}

impl From<TerminalRow> for TerminalSessionRow {
    fn from(r: TerminalRow) -> Self {
        TerminalSessionRow {
            id: r.id,
            node_id: r.node_id,
            created_at: r.created_at,
            expires_at: r.expires_at,
            status: TerminalSessionStatus::parse(&r.status),
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogPolicyRow {
    id: Uuid,
    display_name: String,
    allowed_root: String,
    max_bytes_per_request: i64,
}

impl From<LogPolicyRow> for LogViewerPolicyRow {
    fn from(r: LogPolicyRow) -> Self {
        LogViewerPolicyRow {
            id: r.id,
            display_name: r.display_name,
            allowed_root: r.allowed_root,
            max_bytes_per_request: r.max_bytes_per_request,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FilePolicyRow {
    id: Uuid,
    display_name: String,
    allowed_root: String,
    max_bytes_per_request: i64,
    is_system: bool,
}

impl From<FilePolicyRow> for FileBrowserPolicyRow {
    fn from(r: FilePolicyRow) -> Self {
        FileBrowserPolicyRow {
            id: r.id,
            display_name: r.display_name,
            allowed_root: r.allowed_root,
            max_bytes_per_request: r.max_bytes_per_request,
            is_system: r.is_system,
        }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_terminal_session(&self, row: &TerminalSessionRow) -> PersistResult<()> {
        sqlx::query(
            "INSERT INTO terminal_sessions (id, node_id, created_at, expires_at, status) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(row.id)
        .bind(row.node_id)
        .bind(row.created_at)
        .bind(row.expires_at)
        .bind(row.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_terminal_session(&self, id: SessionId) -> PersistResult<Option<TerminalSessionRow>> {
        let row = sqlx::query_as::<_, TerminalRow>("SELECT * FROM terminal_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn set_terminal_session_status(&self, id: SessionId, status: TerminalSessionStatus) -> PersistResult<()> {
        sqlx::query("UPDATE terminal_sessions SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_expired_terminal_sessions(&self, now: DateTime<Utc>) -> PersistResult<Vec<SessionId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM terminal_sessions WHERE status = 'active' AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn upsert_log_viewer_policy(&self, row: &LogViewerPolicyRow) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO log_viewer_policies (id, display_name, allowed_root, max_bytes_per_request)
            VALUES ($1,$2,$3,$4)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                allowed_root = EXCLUDED.allowed_root,
                max_bytes_per_request = EXCLUDED.max_bytes_per_request
            "#,
        )
        .bind(row.id)
        .bind(&row.display_name)
        .bind(&row.allowed_root)
        .bind(row.max_bytes_per_request)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_log_viewer_policies(&self) -> PersistResult<Vec<LogViewerPolicyRow>> {
        let rows = sqlx::query_as::<_, LogPolicyRow>("SELECT * FROM log_viewer_policies ORDER BY display_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_log_viewer_policy(&self, id: Uuid) -> PersistResult<()> {
        sqlx::query("DELETE FROM log_viewer_policies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_file_browser_policy(&self, row: &FileBrowserPolicyRow) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file_browser_policies (id, display_name, allowed_root, max_bytes_per_request, is_system)
            VALUES ($1,$2,$3,$4,$5)
            ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                allowed_root = EXCLUDED.allowed_root,
                max_bytes_per_request = EXCLUDED.max_bytes_per_request,
                is_system = EXCLUDED.is_system
            "#,
        )
        .bind(row.id)
        .bind(&row.display_name)
        .bind(&row.allowed_root)
        .bind(row.max_bytes_per_request)
        .bind(row.is_system)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_file_browser_policies(&self) -> PersistResult<Vec<FileBrowserPolicyRow>> {
        let rows = sqlx::query_as::<_, FilePolicyRow>("SELECT * FROM file_browser_policies ORDER BY display_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_file_browser_policy(&self, id: Uuid) -> PersistResult<()> {
        sqlx::query("DELETE FROM file_browser_policies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ─── In-memory ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySessionStore {
    terminal_sessions: Mutex<HashMap<SessionId, TerminalSessionRow>>,
    log_policies: Mutex<HashMap<Uuid, LogViewerPolicyRow>>,
    file_policies: Mutex<HashMap<Uuid, FileBrowserPolicyRow>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_terminal_session(&self, row: &TerminalSessionRow) -> PersistResult<()> {
        self.terminal_sessions.lock().insert(row.id, row.clone());
        Ok(())
    }

    async fn get_terminal_session(&self, id: SessionId) -> PersistResult<Option<TerminalSessionRow>> {
        Ok(self.terminal_sessions.lock().get(&id).cloned())
    }

    async fn set_terminal_session_status(&self, id: SessionId, status: TerminalSessionStatus) -> PersistResult<()> {
        if let Some(row) = self.terminal_sessions.lock().get_mut(&id) {
            row.status = status;
        }
        Ok(())
    }

    async fn list_expired_terminal_sessions(&self, now: DateTime<Utc>) -> PersistResult<Vec<SessionId>> {
        Ok(self
            .terminal_sessions
            .lock()
            .values()
            .filter(|r| r.status == TerminalSessionStatus::Active && r.expires_at <= now)
            .map(|r| r.id)
            .collect())
    }

    async fn upsert_log_viewer_policy(&self, row: &LogViewerPolicyRow) -> PersistResult<()> {
        self.log_policies.lock().insert(row.id, row.clone());
        Ok(())
    }

    async fn list_log_viewer_policies(&self) -> PersistResult<Vec<LogViewerPolicyRow>> {
        Ok(self.log_policies.lock().values().cloned().collect())
    }

    async fn delete_log_viewer_policy(&self, id: Uuid) -> PersistResult<()> {
        self.log_policies.lock().remove(&id);
        Ok(())
    }

    async fn upsert_file_browser_policy(&self, row: &FileBrowserPolicyRow) -> PersistResult<()> {
        self.file_policies.lock().insert(row.id, row.clone());
        Ok(())
    }

    async fn list_file_browser_policies(&self) -> PersistResult<Vec<FileBrowserPolicyRow>> {
        Ok(self.file_policies.lock().values().cloned().collect())
    }

    async fn delete_file_browser_policy(&self, id: Uuid) -> PersistResult<()> {
        self.file_policies.lock().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_session(expires_in: Duration) -> TerminalSessionRow {
        let now = Utc::now();
        TerminalSessionRow {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            created_at: now,
            expires_at: now + expires_in,
            status: TerminalSessionStatus::Active,
        }
    }

    #[tokio::test]
    async fn expired_sessions_are_listed_and_active_ones_are_not() {
        let store = InMemorySessionStore::new();
        let expired = sample_session(Duration::seconds(-10));
        let active = sample_session(Duration::seconds(600));
        store.create_terminal_session(&expired).await.unwrap();
        store.create_terminal_session(&active).await.unwrap();

        let ids = store.list_expired_terminal_sessions(Utc::now()).await.unwrap();
        assert_eq!(ids, vec![expired.id]);
    }

    #[tokio::test]
    async fn closing_a_session_removes_it_from_expiry_sweep() {
        let store = InMemorySessionStore::new();
        let session = sample_session(Duration::seconds(-10));
        store.create_terminal_session(&session).await.unwrap();
        store
            .set_terminal_session_status(session.id, TerminalSessionStatus::Closed)
            .await
            .unwrap();

        let ids = store.list_expired_terminal_sessions(Utc::now()).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn log_viewer_policy_crud() {
        let store = InMemorySessionStore::new();
        let policy = LogViewerPolicyRow {
            id: Uuid::new_v4(),
            display_name: "syslog".to_string(),
            allowed_root: "/var/log".to_string(),
            max_bytes_per_request: 1_048_576,
        };
        store.upsert_log_viewer_policy(&policy).await.unwrap();
        assert_eq!(store.list_log_viewer_policies().await.unwrap().len(), 1);

        store.delete_log_viewer_policy(policy.id).await.unwrap();
        assert!(store.list_log_viewer_policies().await.unwrap().is_empty());
    }
}
