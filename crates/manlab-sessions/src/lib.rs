//! TTL-bound session registries.
//!
//! Terminal sessions are durable (survive a hub restart enough to be
//! reported as `Expired` rather than vanish silently); log-viewer,
//! file-browser and download handles are short-lived, request-scoped
//! grants and only need to exist in memory for the hub process's lifetime.
//! All four share the same shape: issue with a TTL, check policy on every
//! use, expire lazily on lookup plus a periodic sweep as a backstop.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use manlab_audit::{AuditKind, AuditLogger};
use manlab_config::HubConfig;
use manlab_persist::{
    FileBrowserPolicyRow, LogViewerPolicyRow, SessionStore, TerminalSessionRow,
    TerminalSessionStatus,
};
use manlab_proto::{ManlabError, ManlabResult, NodeId, SessionId, StreamId};
use manlab_registry::NodeRegistry;
use manlab_streaming::StreamRegistry;
use parking_lot::RwLock;
use uuid::Uuid;

// ─── Policy allowlists ────────────────────────────────────────────────────────

/// True if `requested` falls under `allowed_root`. Comparison is purely
/// lexical — the hub never touches the filesystem itself, that's the
/// agent's job; this only gates which paths a session is even allowed to
/// ask the agent for.
pub fn path_allowed(allowed_root: &str, requested: &str) -> bool {
    let root = allowed_root.trim_end_matches('/');
    let requested = requested.trim_end_matches('/');
    requested == root || requested.starts_with(&format!("{root}/"))
}

pub struct PolicyRegistry {
    store: Arc<dyn SessionStore>,
    audit: AuditLogger,
}

impl PolicyRegistry {
    pub fn new(store: Arc<dyn SessionStore>, audit: AuditLogger) -> Self {
        Self { store, audit }
    }

    pub async fn upsert_log_viewer_policy(&self, row: &LogViewerPolicyRow) -> ManlabResult<()> {
        self.store
            .upsert_log_viewer_policy(row)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    pub async fn list_log_viewer_policies(&self) -> ManlabResult<Vec<LogViewerPolicyRow>> {
        self.store
            .list_log_viewer_policies()
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    pub async fn upsert_file_browser_policy(&self, row: &FileBrowserPolicyRow) -> ManlabResult<()> {
        self.store
            .upsert_file_browser_policy(row)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    pub async fn list_file_browser_policies(&self) -> ManlabResult<Vec<FileBrowserPolicyRow>> {
        self.store
            .list_file_browser_policies()
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    /// Check a requested path against a named file-browser policy, failing
    /// closed if the policy doesn't exist or the path falls outside its root.
    /// A violation is audited before the error is returned, so a rejected
    /// request still leaves a trail even though no command ever reaches
    /// the agent.
    pub async fn check_file_path(&self, policy_id: Uuid, requested_path: &str) -> ManlabResult<()> {
        let policies = self.list_file_browser_policies().await?;
        let policy = policies
            .into_iter()
            .find(|p| p.id == policy_id)
            .ok_or_else(|| ManlabError::NotFound(format!("file browser policy {policy_id}")))?;
        if path_allowed(&policy.allowed_root, requested_path) {
            Ok(())
        } else {
            self.audit
                .record(
                    AuditKind::Policy,
                    "file_browser_policy_violation",
                    None,
                    Some(&policy_id.to_string()),
                    false,
                    serde_json::json!({"requested_path": requested_path, "allowed_root": policy.allowed_root}),
                )
                .await?;
            Err(ManlabError::PolicyViolation(format!(
                "{requested_path} is outside allowed root {}",
                policy.allowed_root
            )))
        }
    }

    pub async fn check_log_path(&self, policy_id: Uuid, requested_path: &str) -> ManlabResult<()> {
        let policies = self.list_log_viewer_policies().await?;
        let policy = policies
            .into_iter()
            .find(|p| p.id == policy_id)
            .ok_or_else(|| ManlabError::NotFound(format!("log viewer policy {policy_id}")))?;
        if path_allowed(&policy.allowed_root, requested_path) {
            Ok(())
        } else {
            self.audit
                .record(
                    AuditKind::Policy,
                    "log_viewer_policy_violation",
                    None,
                    Some(&policy_id.to_string()),
                    false,
                    serde_json::json!({"requested_path": requested_path, "allowed_root": policy.allowed_root}),
                )
                .await?;
            Err(ManlabError::PolicyViolation(format!(
                "{requested_path} is outside allowed root {}",
                policy.allowed_root
            )))
        }
    }
}

// ─── Terminal sessions (durable) ──────────────────────────────────────────────

pub struct TerminalSessionRegistry {
    store: Arc<dyn SessionStore>,
    config: Arc<HubConfig>,
    audit: AuditLogger,
}

impl TerminalSessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, config: Arc<HubConfig>, audit: AuditLogger) -> Self {
        Self { store, config, audit }
    }

    pub async fn open(&self, node_id: NodeId, requested_ttl_secs: Option<i64>) -> ManlabResult<TerminalSessionRow> {
        let ttl = requested_ttl_secs.unwrap_or(self.config.session_default_ttl_secs);
        if !manlab_proto::validate_ttl_secs(ttl, self.config.session_max_ttl_secs) {
            return Err(ManlabError::BadRequest(format!(
                "ttl_secs must be in 1..={}, got {ttl}",
                self.config.session_max_ttl_secs
            )));
        }
        let now = Utc::now();
        let row = TerminalSessionRow {
            id: Uuid::new_v4(),
            node_id,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl),
            status: TerminalSessionStatus::Active,
        };
        self.store
            .create_terminal_session(&row)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        self.audit
            .record(
                AuditKind::Session,
                "terminal_session_opened",
                None,
                Some(&node_id.to_string()),
                true,
                serde_json::json!({"session_id": row.id, "ttl_secs": ttl}),
            )
            .await?;
        Ok(row)
    }

    /// Fetch a session, lazily marking it `Expired` if its TTL has lapsed
    /// since the last sweep. Callers should treat a non-`Active` result the
    /// same as not-found.
    pub async fn get_active(&self, id: SessionId) -> ManlabResult<Option<TerminalSessionRow>> {
        let Some(mut row) = self.store.get_terminal_session(id).await.map_err(|e| ManlabError::Internal(e.to_string()))? else {
            return Ok(None);
        };
        if row.status == TerminalSessionStatus::Active && row.expires_at <= Utc::now() {
            self.store
                .set_terminal_session_status(id, TerminalSessionStatus::Expired)
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
            row.status = TerminalSessionStatus::Expired;
        }
        Ok((row.status == TerminalSessionStatus::Active).then_some(row))
    }

    pub async fn close(&self, id: SessionId) -> ManlabResult<()> {
        self.store
            .set_terminal_session_status(id, TerminalSessionStatus::Closed)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        self.audit
            .record(AuditKind::Session, "terminal_session_closed", None, None, true, serde_json::json!({"session_id": id}))
            .await?;
        Ok(())
    }

    /// Periodic backstop sweep: mark anything still `Active` but past its
    /// TTL as `Expired`, for sessions nobody ever looked up again.
    pub async fn sweep_expired(&self) -> ManlabResult<usize> {
        let expired = self
            .store
            .list_expired_terminal_sessions(Utc::now())
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        for id in &expired {
            self.store
                .set_terminal_session_status(*id, TerminalSessionStatus::Expired)
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
        }
        Ok(expired.len())
    }
}

// ─── Ephemeral handles (log viewer / file browser) ────────────────────────────
//
// Downloads have their own lifecycle below (`DownloadSessionRegistry`);
// log-tail and file-browser grants are simple request-scoped TTL handles
// with no status machine of their own.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralKind {
    LogViewer,
    FileBrowser,
}

#[derive(Debug, Clone)]
pub struct EphemeralHandle {
    pub id: SessionId,
    pub kind: EphemeralKind,
    pub node_id: NodeId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// In-memory TTL registry for handles that don't need to survive a hub
/// restart: a dropped download or log-tail handle is simply re-requested.
pub struct EphemeralSessionRegistry {
    config: Arc<HubConfig>,
    handles: RwLock<HashMap<SessionId, EphemeralHandle>>,
}

impl EphemeralSessionRegistry {
    pub fn new(config: Arc<HubConfig>) -> Self {
        Self { config, handles: RwLock::new(HashMap::new()) }
    }

    pub fn issue(&self, kind: EphemeralKind, node_id: NodeId, ttl_secs: i64) -> ManlabResult<EphemeralHandle> {
        if !manlab_proto::validate_ttl_secs(ttl_secs, self.config.session_max_ttl_secs) {
            return Err(ManlabError::BadRequest(format!(
                "ttl_secs must be in 1..={}, got {ttl_secs}",
                self.config.session_max_ttl_secs
            )));
        }
        let now = Utc::now();
        let handle = EphemeralHandle {
            id: Uuid::new_v4(),
            kind,
            node_id,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        };
        self.handles.write().insert(handle.id, handle.clone());
        Ok(handle)
    }

    pub fn get_active(&self, id: SessionId) -> Option<EphemeralHandle> {
        let mut handles = self.handles.write();
        match handles.get(&id) {
            Some(h) if h.expires_at > Utc::now() => Some(h.clone()),
            Some(_) => {
                handles.remove(&id);
                None
            }
            None => None,
        }
    }

    pub fn revoke(&self, id: SessionId) {
        self.handles.write().remove(&id);
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut handles = self.handles.write();
        let before = handles.len();
        handles.retain(|_, h| h.expires_at > now);
        before - handles.len()
    }
}

// ─── Download sessions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Preparing,
    Ready,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition under the download
    /// state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DownloadStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Queued, Preparing)
                | (Queued, Cancelled)
                | (Preparing, Ready)
                | (Preparing, Failed)
                | (Preparing, Cancelled)
                | (Ready, Downloading)
                | (Ready, Failed)
                | (Ready, Cancelled)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

struct DownloadSession {
    node_id: NodeId,
    expires_at: DateTime<Utc>,
    status: DownloadStatus,
    stream_id: Option<StreamId>,
}

/// Tracks a download's status machine from grant to completion and wires
/// its cancel token through to whatever streaming transfer ends up bound
/// to it. Unlike the plain [`EphemeralSessionRegistry`] handles, a download
/// has a lifecycle worth reporting on its own: the dashboard tracks it
/// through `Preparing`/`Downloading` rather than just seeing it appear and
/// disappear.
pub struct DownloadSessionRegistry {
    config: Arc<HubConfig>,
    registry: Arc<NodeRegistry>,
    streams: Arc<StreamRegistry>,
    sessions: RwLock<HashMap<SessionId, DownloadSession>>,
}

impl DownloadSessionRegistry {
    pub fn new(config: Arc<HubConfig>, registry: Arc<NodeRegistry>, streams: Arc<StreamRegistry>) -> Self {
        Self { config, registry, streams, sessions: RwLock::new(HashMap::new()) }
    }

    /// Grant a new download session in `Queued` status.
    pub fn issue(&self, node_id: NodeId, ttl_secs: i64) -> ManlabResult<SessionId> {
        if !manlab_proto::validate_ttl_secs(ttl_secs, self.config.session_max_ttl_secs) {
            return Err(ManlabError::BadRequest(format!(
                "ttl_secs must be in 1..={}, got {ttl_secs}",
                self.config.session_max_ttl_secs
            )));
        }
        let id = Uuid::new_v4();
        let session = DownloadSession {
            node_id,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
            status: DownloadStatus::Queued,
            stream_id: None,
        };
        self.sessions.write().insert(id, session);
        self.registry.publish_download_status_changed(id, DownloadStatus::Queued);
        Ok(id)
    }

    pub fn status(&self, id: SessionId) -> Option<DownloadStatus> {
        self.sessions.read().get(&id).map(|s| s.status)
    }

    /// Bind the streaming transfer backing this download once the agent
    /// opens it, advancing `Queued -> Preparing -> Ready`.
    pub fn bind_stream(&self, id: SessionId, stream_id: StreamId) -> ManlabResult<()> {
        self.transition(id, DownloadStatus::Preparing)?;
        {
            let mut sessions = self.sessions.write();
            let session = sessions.get_mut(&id).ok_or_else(|| ManlabError::NotFound(format!("download session {id}")))?;
            session.stream_id = Some(stream_id);
        }
        self.transition(id, DownloadStatus::Ready)
    }

    pub fn start(&self, id: SessionId) -> ManlabResult<()> {
        self.transition(id, DownloadStatus::Downloading)
    }

    pub fn complete(&self, id: SessionId) -> ManlabResult<()> {
        self.transition(id, DownloadStatus::Completed)
    }

    pub fn fail(&self, id: SessionId) -> ManlabResult<()> {
        self.transition(id, DownloadStatus::Failed)
    }

    /// Record a progress sample and fan it out to the dashboard. Does not
    /// touch the status machine: a download only reports progress while
    /// already `Downloading`.
    pub fn record_progress(&self, id: SessionId, bytes_received: u64, total_bytes: Option<u64>) {
        self.registry.publish_download_progress(id, bytes_received, total_bytes);
    }

    /// Cancel a download: moves it to `Cancelled` and, if a stream is
    /// already bound, fails that stream's writer so it observes the
    /// cancellation and stops producing chunks, same as any other abort.
    pub async fn cancel(&self, id: SessionId) -> ManlabResult<()> {
        let stream_id = {
            let sessions = self.sessions.read();
            let session = sessions.get(&id).ok_or_else(|| ManlabError::NotFound(format!("download session {id}")))?;
            session.stream_id
        };
        self.transition(id, DownloadStatus::Cancelled)?;
        if let Some(stream_id) = stream_id {
            if let Some(stream) = self.streams.get(stream_id) {
                let _ = stream.fail("cancelled by operator").await;
            }
        }
        Ok(())
    }

    fn transition(&self, id: SessionId, next: DownloadStatus) -> ManlabResult<()> {
        {
            let mut sessions = self.sessions.write();
            let session = sessions.get_mut(&id).ok_or_else(|| ManlabError::NotFound(format!("download session {id}")))?;
            if !session.status.can_transition_to(next) {
                return Err(ManlabError::BadRequest(format!(
                    "cannot move download session {id} from {} to {next}",
                    session.status
                )));
            }
            session.status = next;
        }
        self.registry.publish_download_status_changed(id, next);
        Ok(())
    }

    /// Drop download grants nobody ever claimed or finished.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manlab_persist::{InMemoryAuditStore, InMemorySessionStore};

    fn terminal_registry() -> TerminalSessionRegistry {
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        TerminalSessionRegistry::new(Arc::new(InMemorySessionStore::new()), Arc::new(HubConfig::default()), audit)
    }

    #[test]
    fn path_allowed_matches_root_and_children_but_not_siblings() {
        assert!(path_allowed("/var/log", "/var/log/syslog"));
        assert!(path_allowed("/var/log", "/var/log"));
        assert!(!path_allowed("/var/log", "/var/logging/evil"));
        assert!(!path_allowed("/var/log", "/etc/passwd"));
    }

    #[tokio::test]
    async fn log_path_outside_root_is_rejected_and_audited() {
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        let store = Arc::new(InMemorySessionStore::new());
        let policies = PolicyRegistry::new(store, audit.clone());

        let policy = LogViewerPolicyRow {
            id: Uuid::new_v4(),
            display_name: "app logs".to_string(),
            allowed_root: "/var/log/app".to_string(),
            max_bytes_per_request: 1024 * 1024,
        };
        policies.upsert_log_viewer_policy(&policy).await.unwrap();

        let result = policies.check_log_path(policy.id, "/etc/passwd").await;
        assert!(matches!(result, Err(ManlabError::PolicyViolation(_))));

        let events = audit.recent(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "log_viewer_policy_violation");
    }

    #[tokio::test]
    async fn a_zero_or_negative_ttl_is_rejected_not_clamped() {
        let registry = terminal_registry();
        let node_id = Uuid::new_v4();
        assert!(matches!(registry.open(node_id, Some(-1)).await, Err(ManlabError::BadRequest(_))));
        assert!(matches!(registry.open(node_id, Some(0)).await, Err(ManlabError::BadRequest(_))));
    }

    #[tokio::test]
    async fn opened_session_is_active_then_expires() {
        let registry = terminal_registry();
        let node_id = Uuid::new_v4();
        let session = registry.open(node_id, Some(1)).await.unwrap();
        assert_eq!(session.status, TerminalSessionStatus::Active);

        // Past its expiry, the next lookup lazily expires it.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let fetched = registry.get_active(session.id).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn closing_a_session_makes_it_inactive() {
        let registry = terminal_registry();
        let node_id = Uuid::new_v4();
        let session = registry.open(node_id, None).await.unwrap();
        registry.close(session.id).await.unwrap();
        assert!(registry.get_active(session.id).await.unwrap().is_none());
    }

    #[test]
    fn ephemeral_issue_rejects_a_zero_or_negative_ttl() {
        let registry = EphemeralSessionRegistry::new(Arc::new(HubConfig::default()));
        assert!(matches!(
            registry.issue(EphemeralKind::LogViewer, Uuid::new_v4(), -1),
            Err(ManlabError::BadRequest(_))
        ));
        assert!(matches!(
            registry.issue(EphemeralKind::LogViewer, Uuid::new_v4(), 0),
            Err(ManlabError::BadRequest(_))
        ));
    }

    #[test]
    fn ephemeral_handle_expires_on_lookup() {
        let registry = EphemeralSessionRegistry::new(Arc::new(HubConfig::default()));
        let handle = registry.issue(EphemeralKind::FileBrowser, Uuid::new_v4(), 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(registry.get_active(handle.id).is_none());
    }

    #[test]
    fn ephemeral_sweep_removes_expired_handles() {
        let registry = EphemeralSessionRegistry::new(Arc::new(HubConfig::default()));
        registry.issue(EphemeralKind::LogViewer, Uuid::new_v4(), 1).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        registry.issue(EphemeralKind::FileBrowser, Uuid::new_v4(), 600).unwrap();
        assert_eq!(registry.sweep_expired(), 1);
    }

    fn download_registry() -> DownloadSessionRegistry {
        let audit = AuditLogger::new(Arc::new(manlab_persist::InMemoryAuditStore::new()));
        let config = Arc::new(HubConfig::default());
        let node_registry = Arc::new(NodeRegistry::new(Arc::new(manlab_persist::InMemoryNodeStore::new()), config.clone(), audit));
        let streams = Arc::new(StreamRegistry::new(config.clone()));
        DownloadSessionRegistry::new(config, node_registry, streams)
    }

    #[test]
    fn download_issue_rejects_a_zero_or_negative_ttl() {
        let registry = download_registry();
        assert!(matches!(registry.issue(Uuid::new_v4(), 0), Err(ManlabError::BadRequest(_))));
        assert!(matches!(registry.issue(Uuid::new_v4(), -5), Err(ManlabError::BadRequest(_))));
    }

    #[test]
    fn download_session_walks_the_status_machine_to_completion() {
        let registry = download_registry();
        let id = registry.issue(Uuid::new_v4(), 600).unwrap();
        assert_eq!(registry.status(id), Some(DownloadStatus::Queued));

        registry.bind_stream(id, Uuid::new_v4()).unwrap();
        assert_eq!(registry.status(id), Some(DownloadStatus::Ready));

        registry.start(id).unwrap();
        assert_eq!(registry.status(id), Some(DownloadStatus::Downloading));

        registry.complete(id).unwrap();
        assert_eq!(registry.status(id), Some(DownloadStatus::Completed));

        // Completed is terminal: no further transition is legal.
        assert!(matches!(registry.start(id), Err(ManlabError::BadRequest(_))));
    }

    #[tokio::test]
    async fn cancelling_a_bound_download_fails_its_stream() {
        use manlab_streaming::StreamEvent;

        let config = Arc::new(HubConfig::default());
        let audit = AuditLogger::new(Arc::new(manlab_persist::InMemoryAuditStore::new()));
        let node_registry = Arc::new(NodeRegistry::new(Arc::new(manlab_persist::InMemoryNodeStore::new()), config.clone(), audit));
        let streams = Arc::new(StreamRegistry::new(config.clone()));
        let (session, mut rx) = streams.open(Uuid::new_v4(), Some(1024));

        let registry = DownloadSessionRegistry::new(config, node_registry, streams);
        let id = registry.issue(session.node_id, 600).unwrap();
        registry.bind_stream(id, session.id).unwrap();
        registry.start(id).unwrap();

        registry.cancel(id).await.unwrap();
        assert_eq!(registry.status(id), Some(DownloadStatus::Cancelled));

        match rx.recv().await {
            Some(StreamEvent::Error(message)) => assert_eq!(message, "cancelled by operator"),
            other => panic!("expected a cancellation error event, got {other:?}"),
        }
    }
}
