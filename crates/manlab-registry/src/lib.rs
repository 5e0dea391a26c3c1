//! Node registry and per-agent session supervision.
//!
//! Each connected agent gets one logical session: a durable [`Node`] record
//! plus a live outbound channel the dispatcher and scheduler push
//! [`HubMessage`]s through. The transport itself (the websocket split) lives
//! in the hub binary; this crate only owns the bookkeeping — who is
//! connected, who dropped, and the heartbeat/backoff state machine that
//! decides when a node flips to `Offline`.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use manlab_audit::{AuditKind, AuditLogger};
use manlab_config::{HubConfig, NodeTieBreakPolicy};
use manlab_persist::NodeStore;
use manlab_proto::{
    BackoffStatus, CapabilitiesDocument, CommandQueueItem, DashboardEvent, HubMessage, ManlabError,
    ManlabResult, Node, NodeId, NodeStatus, SessionId,
};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Inputs carried by an agent's `Register` frame, decoupled from the wire
/// enum so callers don't need to depend on `manlab_proto::AgentMessage`
/// directly.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub hostname: String,
    pub os: String,
    pub agent_version: String,
    pub ip: Option<String>,
    pub primary_interface: Option<String>,
    pub mac: Option<String>,
    pub capabilities: CapabilitiesDocument,
    pub token: Option<String>,
}

struct BackoffState {
    consecutive_failures: u32,
    next_retry_at: Option<DateTime<Utc>>,
}

struct AgentSession {
    node_id: NodeId,
    outbound: mpsc::Sender<HubMessage>,
    connected_at: DateTime<Utc>,
}

/// Live registry of connected agents plus the durable node catalog.
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
    config: Arc<HubConfig>,
    audit: AuditLogger,
    dashboard_tx: broadcast::Sender<DashboardEvent>,
    sessions: RwLock<HashMap<NodeId, AgentSession>>,
    backoff: RwLock<HashMap<NodeId, BackoffState>>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn NodeStore>, config: Arc<HubConfig>, audit: AuditLogger) -> Self {
        let (dashboard_tx, _rx) = broadcast::channel(256);
        Self {
            store,
            config,
            audit,
            dashboard_tx,
            sessions: RwLock::new(HashMap::new()),
            backoff: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to the dashboard fan-out. Every connected dashboard calls
    /// this once and drains its own receiver.
    pub fn subscribe_dashboard(&self) -> broadcast::Receiver<DashboardEvent> {
        self.dashboard_tx.subscribe()
    }

    fn publish(&self, event: DashboardEvent) {
        let _ = self.dashboard_tx.send(event);
    }

    /// Validate a bearer token against the configured shared secret, if one
    /// is set. Registration always fails closed if a token is required and
    /// absent or wrong.
    fn check_auth(&self, token: Option<&str>) -> ManlabResult<()> {
        let Some(expected) = self.config.agent_auth_token.as_deref() else {
            return Ok(());
        };
        match token {
            Some(t) if t == expected => Ok(()),
            _ => Err(ManlabError::Unauthorized("invalid agent token".to_string())),
        }
    }

    /// Register (or re-register) an agent. Applies the tie-break policy
    /// when a node with the same `hostname` is already connected:
    /// `NewestWins` evicts the prior session and keeps this one;
    /// `RejectNew` keeps the prior session and rejects this registration.
    pub async fn register(
        &self,
        req: RegisterRequest,
        outbound: mpsc::Sender<HubMessage>,
    ) -> ManlabResult<NodeId> {
        self.check_auth(req.token.as_deref())?;
        if !manlab_proto::validate_hostname(&req.hostname) {
            return Err(ManlabError::BadRequest("invalid hostname".to_string()));
        }

        let existing = self
            .store
            .list()
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?
            .into_iter()
            .find(|n| n.hostname == req.hostname);

        let node_id = match existing {
            Some(node) if self.sessions.read().contains_key(&node.id) => {
                match self.config.node_tie_break {
                    NodeTieBreakPolicy::RejectNew => {
                        self.audit
                            .record(
                                AuditKind::Node,
                                "node_registration_rejected",
                                None,
                                Some(&node.id.to_string()),
                                false,
                                serde_json::json!({"hostname": req.hostname, "reason": "already connected"}),
                            )
                            .await?;
                        return Err(ManlabError::Conflict(format!(
                            "node {} already has an active session",
                            req.hostname
                        )));
                    }
                    NodeTieBreakPolicy::NewestWins => {
                        warn!(hostname = %req.hostname, "evicting prior session for re-registration");
                        self.sessions.write().remove(&node.id);
                        node.id
                    }
                }
            }
            Some(node) => node.id,
            None => uuid::Uuid::new_v4(),
        };

        let node = Node {
            id: node_id,
            hostname: req.hostname.clone(),
            ip: req.ip,
            os: req.os,
            agent_version: req.agent_version,
            last_seen: Utc::now(),
            status: NodeStatus::Online,
            capabilities: req.capabilities,
            primary_interface: req.primary_interface,
            mac: req.mac,
        };

        self.store
            .upsert(&node)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;

        self.sessions.write().insert(
            node_id,
            AgentSession {
                node_id,
                outbound,
                connected_at: Utc::now(),
            },
        );
        self.backoff.write().remove(&node_id);

        self.audit
            .record(
                AuditKind::Node,
                "node_registered",
                None,
                Some(&node_id.to_string()),
                true,
                serde_json::json!({"hostname": req.hostname}),
            )
            .await?;
        self.publish(DashboardEvent::NodeRegistered { node: node.clone() });
        info!(node_id = %node_id, hostname = %node.hostname, "node registered");
        Ok(node_id)
    }

    /// Record a received heartbeat: refreshes `last_seen`, flips the node
    /// back online if it had backed off, and resets the failure counter.
    pub async fn record_heartbeat(&self, node_id: NodeId) -> ManlabResult<()> {
        let mut node = self
            .store
            .get(node_id)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?
            .ok_or_else(|| ManlabError::NotFound(node_id.to_string()))?;

        node.last_seen = Utc::now();
        let was_offline = node.status != NodeStatus::Online;
        node.status = NodeStatus::Online;
        self.store
            .upsert(&node)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;

        let had_backoff = self.backoff.write().remove(&node_id).is_some();
        if was_offline || had_backoff {
            self.publish(DashboardEvent::NodeStatusChanged {
                node_id,
                status: NodeStatus::Online,
            });
        }
        Ok(())
    }

    /// Called by the heartbeat sweep when a node has missed its deadline.
    /// Bumps the exponential backoff counter and, past
    /// `heartbeat_miss_threshold`, flips the node offline.
    pub async fn record_heartbeat_miss(&self, node_id: NodeId) -> ManlabResult<()> {
        let mut backoff_table = self.backoff.write();
        let state = backoff_table.entry(node_id).or_insert(BackoffState {
            consecutive_failures: 0,
            next_retry_at: None,
        });
        state.consecutive_failures += 1;
        let delay = self.config.backoff_delay_secs(state.consecutive_failures);
        state.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(delay as i64));
        let failures = state.consecutive_failures;
        let next_retry_at = state.next_retry_at;
        drop(backoff_table);

        let status = if failures >= self.config.heartbeat_miss_threshold {
            self.sessions.write().remove(&node_id);
            self.store
                .set_status(node_id, NodeStatus::Offline)
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
            self.publish(DashboardEvent::NodeStatusChanged {
                node_id,
                status: NodeStatus::Offline,
            });
            NodeStatus::Offline
        } else {
            NodeStatus::Online
        };

        self.publish(DashboardEvent::BackoffStatus {
            status: BackoffStatus {
                node_id,
                consecutive_failures: failures,
                next_retry_at,
                status,
            },
        });
        Ok(())
    }

    /// Nodes whose last heartbeat is older than `heartbeat_interval_secs`,
    /// i.e. candidates for [`record_heartbeat_miss`]. Called by the hub's
    /// periodic sweep task.
    pub async fn nodes_past_deadline(&self) -> ManlabResult<Vec<NodeId>> {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.heartbeat_interval_secs as i64);
        Ok(self
            .store
            .list()
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online && n.last_seen < cutoff)
            .map(|n| n.id)
            .collect())
    }

    pub fn send_to(&self, node_id: NodeId, message: HubMessage) -> ManlabResult<()> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(&node_id)
            .ok_or_else(|| ManlabError::NotFound(format!("no live session for node {node_id}")))?;
        session
            .outbound
            .try_send(message)
            .map_err(|e| ManlabError::TransportFailed(e.to_string()))
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.sessions.read().contains_key(&node_id)
    }

    pub fn session_age(&self, node_id: NodeId) -> Option<chrono::Duration> {
        self.sessions
            .read()
            .get(&node_id)
            .map(|s| Utc::now() - s.connected_at)
    }

    pub async fn disconnect(&self, node_id: NodeId) -> ManlabResult<()> {
        self.sessions.write().remove(&node_id);
        self.store
            .set_status(node_id, NodeStatus::Offline)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        self.publish(DashboardEvent::NodeStatusChanged {
            node_id,
            status: NodeStatus::Offline,
        });
        Ok(())
    }

    pub async fn get(&self, node_id: NodeId) -> ManlabResult<Option<Node>> {
        self.store
            .get(node_id)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    pub async fn list(&self) -> ManlabResult<Vec<Node>> {
        self.store
            .list()
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    /// Fan out a batch of process alerts to the dashboard group. Callers
    /// pass anything `Serialize`; the wire event carries the alerts as
    /// opaque JSON since dashboards render them, they don't decode them.
    pub fn publish_process_alerts<T: serde::Serialize>(&self, node_id: NodeId, alerts: &T) {
        let alerts = serde_json::to_value(alerts).unwrap_or(serde_json::Value::Null);
        self.publish(DashboardEvent::ProcessAlerts { node_id, alerts });
    }

    /// Fan out a received heartbeat sample to the dashboard group.
    pub fn publish_telemetry(&self, node_id: NodeId, sample: serde_json::Value) {
        self.publish(DashboardEvent::Telemetry { node_id, sample });
    }

    /// Fan out the hub's own memory-pressure reading, as sampled by
    /// `manlab-cleanup`.
    pub fn publish_server_resource_usage(&self, pressure_pct: f32) {
        self.publish(DashboardEvent::ServerResourceUsage { pressure_pct });
    }

    /// Fan out a command's updated state after every queue transition.
    pub fn publish_command_update(&self, command: CommandQueueItem) {
        self.publish(DashboardEvent::CommandUpdate { command });
    }

    /// Fan out a download session's status transition.
    pub fn publish_download_status_changed(&self, session_id: SessionId, status: impl std::fmt::Display) {
        self.publish(DashboardEvent::DownloadStatusChanged { session_id, status: status.to_string() });
    }

    /// Fan out a progress sample for an in-flight download.
    pub fn publish_download_progress(&self, session_id: SessionId, bytes_received: u64, total_bytes: Option<u64>) {
        self.publish(DashboardEvent::DownloadProgress { session_id, bytes_received, total_bytes });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manlab_persist::{InMemoryAuditStore, InMemoryNodeStore};

    fn registry() -> NodeRegistry {
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        NodeRegistry::new(Arc::new(InMemoryNodeStore::new()), Arc::new(HubConfig::default()), audit)
    }

    fn sample_request(hostname: &str) -> RegisterRequest {
        RegisterRequest {
            hostname: hostname.to_string(),
            os: "linux".to_string(),
            agent_version: "1.0.0".to_string(),
            ip: Some("10.0.0.1".to_string()),
            primary_interface: Some("eth0".to_string()),
            mac: None,
            capabilities: CapabilitiesDocument::default(),
            token: None,
        }
    }

    #[tokio::test]
    async fn register_then_get_reflects_node() {
        let reg = registry();
        let (tx, _rx) = mpsc::channel(8);
        let node_id = reg.register(sample_request("node-1"), tx).await.unwrap();
        let node = reg.get(node_id).await.unwrap().unwrap();
        assert_eq!(node.hostname, "node-1");
        assert_eq!(node.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn newest_wins_evicts_prior_session() {
        let reg = registry();
        let (tx1, _rx1) = mpsc::channel(8);
        let first_id = reg.register(sample_request("node-1"), tx1).await.unwrap();
        assert!(reg.is_connected(first_id));

        let (tx2, _rx2) = mpsc::channel(8);
        let second_id = reg.register(sample_request("node-1"), tx2).await.unwrap();
        assert_eq!(first_id, second_id);
        assert!(reg.is_connected(second_id));
    }

    #[tokio::test]
    async fn reject_new_keeps_prior_session() {
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        let mut config = HubConfig::default();
        config.node_tie_break = NodeTieBreakPolicy::RejectNew;
        let reg = NodeRegistry::new(Arc::new(InMemoryNodeStore::new()), Arc::new(config), audit);

        let (tx1, _rx1) = mpsc::channel(8);
        reg.register(sample_request("node-1"), tx1).await.unwrap();

        let (tx2, _rx2) = mpsc::channel(8);
        let result = reg.register(sample_request("node-1"), tx2).await;
        assert!(matches!(result, Err(ManlabError::Conflict(_))));
    }

    #[tokio::test]
    async fn heartbeat_miss_flips_offline_past_threshold() {
        let reg = registry();
        let (tx, _rx) = mpsc::channel(8);
        let node_id = reg.register(sample_request("node-1"), tx).await.unwrap();

        for _ in 0..reg.config.heartbeat_miss_threshold {
            reg.record_heartbeat_miss(node_id).await.unwrap();
        }

        let node = reg.get(node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(!reg.is_connected(node_id));
    }

    #[tokio::test]
    async fn heartbeat_after_miss_restores_online_and_clears_backoff() {
        let reg = registry();
        let (tx, _rx) = mpsc::channel(8);
        let node_id = reg.register(sample_request("node-1"), tx).await.unwrap();

        reg.record_heartbeat_miss(node_id).await.unwrap();
        reg.record_heartbeat(node_id).await.unwrap();

        let node = reg.get(node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);
    }
}
