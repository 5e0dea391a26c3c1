//! Command queue and dispatch loop.
//!
//! Commands are enqueued `Queued`, picked up by [`Dispatcher::dispatch_ready`]
//! and pushed to the agent's session as `Sent`, then driven to a terminal
//! state by the agent's own `CommandStatus` reports. The optimistic
//! concurrency on [`CommandStore::transition`] is what keeps dispatch
//! at-most-once: two dispatch passes racing on the same row will only have
//! one succeed the `Queued -> Sent` transition.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use manlab_audit::{AuditKind, AuditLogger};
use manlab_config::HubConfig;
use manlab_persist::CommandStore;
use manlab_proto::{
    CommandId, CommandQueueItem, CommandStatus, CommandType, HubMessage, ManlabError,
    ManlabResult, NodeId,
};
use manlab_registry::NodeRegistry;
use parking_lot::Mutex;
use tracing::{info, warn};

pub struct Dispatcher {
    store: Arc<dyn CommandStore>,
    registry: Arc<NodeRegistry>,
    config: Arc<HubConfig>,
    audit: AuditLogger,
    /// When a `Sent`/`InProgress` cancel was requested for a command, kept
    /// only until the agent ACKs a terminal state or `sweep_cancel_timeouts`
    /// force-transitions it — this never needs to survive a hub restart,
    /// an in-flight command resends on reconnect anyway.
    cancel_requested_at: Mutex<HashMap<CommandId, DateTime<Utc>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CommandStore>,
        registry: Arc<NodeRegistry>,
        config: Arc<HubConfig>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            audit,
            cancel_requested_at: Mutex::new(HashMap::new()),
        }
    }

    pub async fn enqueue(
        &self,
        node_id: NodeId,
        command_type: CommandType,
        payload: serde_json::Value,
    ) -> ManlabResult<CommandId> {
        let item = CommandQueueItem {
            id: uuid::Uuid::new_v4(),
            node_id,
            command_type,
            payload: payload.clone(),
            status: CommandStatus::Queued,
            created_at: Utc::now(),
            sent_at: None,
            executed_at: None,
            output_log: String::new(),
            output_truncated: false,
            error: None,
        };
        self.store
            .enqueue(&item)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        self.audit
            .record(
                AuditKind::Command,
                "command_enqueued",
                None,
                Some(&node_id.to_string()),
                true,
                serde_json::json!({"command_id": item.id, "command_type": command_type.wire_name(), "payload": payload}),
            )
            .await?;
        self.registry.publish_command_update(item.clone());
        Ok(item.id)
    }

    /// Enqueue a `ServiceStatus` refresh unless one is already in flight
    /// within the configured cooldown window. Returns `true` if a new
    /// command was enqueued, `false` if coalesced into the existing one.
    pub async fn enqueue_coalesced_service_status(&self, node_id: NodeId) -> ManlabResult<bool> {
        let cooldown_cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.service_status_pending_cooldown_secs);
        let active = self
            .store
            .count_active_service_status(node_id, cooldown_cutoff)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        if active > 0 {
            return Ok(false);
        }
        self.enqueue(node_id, CommandType::ServiceStatus, serde_json::json!({})).await?;
        Ok(true)
    }

    pub async fn get(&self, id: CommandId) -> ManlabResult<Option<CommandQueueItem>> {
        self.store.get(id).await.map_err(|e| ManlabError::Internal(e.to_string()))
    }

    pub async fn list_for_node(&self, node_id: NodeId, limit: i64) -> ManlabResult<Vec<CommandQueueItem>> {
        self.store
            .list_for_node(node_id, limit)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    /// Cancel a command. `Queued` commands are cancelled locally and never
    /// reach the agent; `Sent`/`InProgress` commands get a best-effort
    /// `CancelCommand` pushed to the agent and stay non-terminal until the
    /// agent confirms (or the cancel timeout sweep gives up on them).
    pub async fn cancel(&self, id: CommandId) -> ManlabResult<()> {
        let item = self
            .store
            .get(id)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?
            .ok_or_else(|| ManlabError::NotFound(id.to_string()))?;

        if item.status.is_terminal() {
            return Err(ManlabError::Conflict(format!(
                "command {id} already in terminal state {:?}",
                item.status
            )));
        }

        if item.status == CommandStatus::Queued {
            let ok = self
                .store
                .transition(id, CommandStatus::Queued, CommandStatus::Cancelled, None, Some(Utc::now()), None)
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
            if !ok {
                return Err(ManlabError::Conflict(format!("command {id} changed state concurrently")));
            }
            self.publish_current(id).await;
        } else {
            // Track the request regardless of whether the push below
            // succeeds: a disconnected agent will never ACK, so the
            // cancel-timeout sweep still needs to force-transition this one.
            self.cancel_requested_at.lock().insert(id, Utc::now());
            if self.registry.is_connected(item.node_id) {
                self.registry
                    .send_to(item.node_id, HubMessage::CancelCommand { command_id: id })?;
            }
        }

        self.audit
            .record(
                AuditKind::Command,
                "command_cancel_requested",
                None,
                Some(&item.node_id.to_string()),
                true,
                serde_json::json!({"command_id": id}),
            )
            .await?;
        Ok(())
    }

    /// Apply a status report from an agent. Accepts the transition if it is
    /// legal from the command's current state; rejects (logs, doesn't
    /// error) illegal jumps so a duplicated or late report can't corrupt
    /// the queue.
    pub async fn apply_status_report(
        &self,
        id: CommandId,
        next: CommandStatus,
        logs: Option<&str>,
        error: Option<&str>,
    ) -> ManlabResult<()> {
        let Some(current) = self.store.get(id).await.map_err(|e| ManlabError::Internal(e.to_string()))? else {
            warn!(command_id = %id, "status report for unknown command");
            return Ok(());
        };

        if !current.status.can_transition_to(next) {
            warn!(command_id = %id, from = ?current.status, to = ?next, "rejected illegal command transition");
            return Ok(());
        }

        if let Some(chunk) = logs {
            self.store
                .append_output(id, chunk, self.config.command_output_log_cap_bytes)
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
        }

        let executed_at = next.is_terminal().then(Utc::now);
        let ok = self
            .store
            .transition(id, current.status, next, None, executed_at, error)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        if !ok {
            warn!(command_id = %id, "command transition lost a race, dropping stale report");
            return Ok(());
        }
        if next.is_terminal() {
            self.cancel_requested_at.lock().remove(&id);
        }
        self.publish_current(id).await;
        Ok(())
    }

    /// Re-fetch a command and fan it out to the dashboard group. Used after
    /// every queue transition so the dashboard sees `Queued -> Sent ->
    /// InProgress -> <terminal>` as it happens, not just the final state.
    async fn publish_current(&self, id: CommandId) {
        if let Ok(Some(item)) = self.store.get(id).await {
            self.registry.publish_command_update(item);
        }
    }

    /// Push every `Queued` command for a node that just (re)connected.
    /// Returns the number of commands dispatched.
    pub async fn dispatch_ready(&self, node_id: NodeId) -> ManlabResult<usize> {
        if !self.registry.is_connected(node_id) {
            return Ok(0);
        }
        let queued = self
            .store
            .list_queued_for_node(node_id)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;

        let mut dispatched = 0;
        for item in queued {
            let ok = self
                .store
                .transition(item.id, CommandStatus::Queued, CommandStatus::Sent, Some(Utc::now()), None, None)
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
            if !ok {
                continue;
            }
            if let Err(e) = self.registry.send_to(
                node_id,
                HubMessage::Command {
                    command_id: item.id,
                    command_type: item.command_type,
                    payload: item.payload.clone(),
                },
            ) {
                warn!(command_id = %item.id, error = %e, "failed to push dispatched command, reverting to queued");
                let _ = self
                    .store
                    .transition(item.id, CommandStatus::Sent, CommandStatus::Queued, None, None, None)
                    .await;
                continue;
            }
            self.publish_current(item.id).await;
            dispatched += 1;
        }
        if dispatched > 0 {
            info!(node_id = %node_id, count = dispatched, "dispatched queued commands");
        }
        Ok(dispatched)
    }

    /// Sweep `Sent` commands whose agent never confirmed `InProgress`
    /// within `command_deadline_secs`, failing them so they don't linger
    /// forever waiting on an agent that dropped the frame.
    pub async fn sweep_timed_out(&self) -> ManlabResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.command_deadline_secs);
        let stale = self
            .store
            .list_sent_older_than(cutoff)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;

        let mut failed = 0;
        for item in stale {
            let ok = self
                .store
                .transition(
                    item.id,
                    CommandStatus::Sent,
                    CommandStatus::Failed,
                    None,
                    Some(Utc::now()),
                    Some("command deadline exceeded without agent confirmation"),
                )
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
            if ok {
                self.publish_current(item.id).await;
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Force-transition commands whose cancel request has outlived
    /// `cancel_timeout_secs` without an agent ACK. A cancel that does get
    /// ACKed (or superseded by any other terminal report) clears its own
    /// entry in `apply_status_report`, so this only ever catches commands
    /// the agent never answered.
    pub async fn sweep_cancel_timeouts(&self) -> ManlabResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.cancel_timeout_secs);
        let overdue: Vec<CommandId> = self
            .cancel_requested_at
            .lock()
            .iter()
            .filter(|(_, requested_at)| **requested_at <= cutoff)
            .map(|(id, _)| *id)
            .collect();

        let mut cancelled = 0;
        for id in overdue {
            let Some(item) = self.store.get(id).await.map_err(|e| ManlabError::Internal(e.to_string()))? else {
                self.cancel_requested_at.lock().remove(&id);
                continue;
            };
            if item.status.is_terminal() {
                self.cancel_requested_at.lock().remove(&id);
                continue;
            }
            let ok = self
                .store
                .transition(
                    id,
                    item.status,
                    CommandStatus::Cancelled,
                    None,
                    Some(Utc::now()),
                    Some("cancel timeout exceeded without agent confirmation"),
                )
                .await
                .map_err(|e| ManlabError::Internal(e.to_string()))?;
            self.cancel_requested_at.lock().remove(&id);
            if ok {
                self.publish_current(id).await;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manlab_persist::{InMemoryAuditStore, InMemoryCommandStore, InMemoryNodeStore};
    use tokio::sync::mpsc;

    async fn setup() -> (Dispatcher, Arc<NodeRegistry>, NodeId) {
        let config = Arc::new(HubConfig::default());
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        let registry = Arc::new(NodeRegistry::new(
            Arc::new(InMemoryNodeStore::new()),
            config.clone(),
            audit.clone(),
        ));
        let (tx, _rx) = mpsc::channel(16);
        let node_id = registry
            .register(
                manlab_registry::RegisterRequest {
                    hostname: "node-1".to_string(),
                    os: "linux".to_string(),
                    agent_version: "1.0.0".to_string(),
                    ip: None,
                    primary_interface: None,
                    mac: None,
                    capabilities: Default::default(),
                    token: None,
                },
                tx,
            )
            .await
            .unwrap();
        let store: Arc<dyn CommandStore> = Arc::new(InMemoryCommandStore::new());
        let dispatcher = Dispatcher::new(store, registry.clone(), config, audit);
        (dispatcher, registry, node_id)
    }

    #[tokio::test]
    async fn enqueue_then_dispatch_transitions_to_sent() {
        let (dispatcher, _registry, node_id) = setup().await;
        let id = dispatcher
            .enqueue(node_id, CommandType::DockerList, serde_json::json!({}))
            .await
            .unwrap();

        let count = dispatcher.dispatch_ready(node_id).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(dispatcher.get(id).await.unwrap().unwrap().status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn cancel_queued_command_goes_straight_to_cancelled() {
        let (dispatcher, _registry, node_id) = setup().await;
        let id = dispatcher
            .enqueue(node_id, CommandType::DockerList, serde_json::json!({}))
            .await
            .unwrap();
        dispatcher.cancel(id).await.unwrap();
        assert_eq!(dispatcher.get(id).await.unwrap().unwrap().status, CommandStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_terminal_command_is_rejected() {
        let (dispatcher, _registry, node_id) = setup().await;
        let id = dispatcher
            .enqueue(node_id, CommandType::DockerList, serde_json::json!({}))
            .await
            .unwrap();
        dispatcher.cancel(id).await.unwrap();
        let result = dispatcher.cancel(id).await;
        assert!(matches!(result, Err(ManlabError::Conflict(_))));
    }

    #[tokio::test]
    async fn illegal_status_jump_is_ignored() {
        let (dispatcher, _registry, node_id) = setup().await;
        let id = dispatcher
            .enqueue(node_id, CommandType::DockerList, serde_json::json!({}))
            .await
            .unwrap();
        // Still Queued — jumping directly to Success is not a legal transition.
        dispatcher.apply_status_report(id, CommandStatus::Success, None, None).await.unwrap();
        assert_eq!(dispatcher.get(id).await.unwrap().unwrap().status, CommandStatus::Queued);
    }

    #[tokio::test]
    async fn valid_status_reports_drive_to_terminal_state() {
        let (dispatcher, _registry, node_id) = setup().await;
        let id = dispatcher
            .enqueue(node_id, CommandType::DockerList, serde_json::json!({}))
            .await
            .unwrap();
        dispatcher.dispatch_ready(node_id).await.unwrap();
        dispatcher
            .apply_status_report(id, CommandStatus::InProgress, None, None)
            .await
            .unwrap();
        dispatcher
            .apply_status_report(id, CommandStatus::Success, Some("done"), None)
            .await
            .unwrap();

        let item = dispatcher.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, CommandStatus::Success);
        assert!(item.output_log.contains("done"));
    }

    #[tokio::test]
    async fn full_lifecycle_emits_one_command_update_per_transition() {
        let (dispatcher, registry, node_id) = setup().await;
        let mut dashboard = registry.subscribe_dashboard();

        let id = dispatcher.enqueue(node_id, CommandType::DockerList, serde_json::json!({})).await.unwrap();
        dispatcher.dispatch_ready(node_id).await.unwrap();
        dispatcher.apply_status_report(id, CommandStatus::InProgress, None, None).await.unwrap();
        dispatcher.apply_status_report(id, CommandStatus::Success, Some("[]"), None).await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = dashboard.try_recv() {
            if let manlab_proto::DashboardEvent::CommandUpdate { command } = event {
                if command.id == id {
                    statuses.push(command.status);
                }
            }
        }
        assert_eq!(
            statuses,
            vec![CommandStatus::Queued, CommandStatus::Sent, CommandStatus::InProgress, CommandStatus::Success]
        );
    }

    #[tokio::test]
    async fn cancel_timeout_force_transitions_an_unacked_sent_command() {
        let config = Arc::new(HubConfig {
            cancel_timeout_secs: 1,
            ..HubConfig::default()
        });
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        let registry = Arc::new(NodeRegistry::new(Arc::new(InMemoryNodeStore::new()), config.clone(), audit.clone()));
        let (tx, _rx) = mpsc::channel(16);
        let node_id = registry
            .register(
                manlab_registry::RegisterRequest {
                    hostname: "node-1".to_string(),
                    os: "linux".to_string(),
                    agent_version: "1.0.0".to_string(),
                    ip: None,
                    primary_interface: None,
                    mac: None,
                    capabilities: Default::default(),
                    token: None,
                },
                tx,
            )
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(InMemoryCommandStore::new()), registry.clone(), config, audit);

        let id = dispatcher.enqueue(node_id, CommandType::Shell, serde_json::json!({"cmd": "uptime"})).await.unwrap();
        dispatcher.dispatch_ready(node_id).await.unwrap();
        dispatcher.apply_status_report(id, CommandStatus::InProgress, None, None).await.unwrap();

        // The agent never ACKs the cancel.
        dispatcher.cancel(id).await.unwrap();
        assert_eq!(dispatcher.get(id).await.unwrap().unwrap().status, CommandStatus::InProgress);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let cancelled = dispatcher.sweep_cancel_timeouts().await.unwrap();
        assert_eq!(cancelled, 1);
        let item = dispatcher.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, CommandStatus::Cancelled);
        assert!(item.error.as_deref().unwrap_or("").contains("cancel timeout"));

        // Nothing left to re-sweep.
        assert_eq!(dispatcher.sweep_cancel_timeouts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn an_acked_cancel_is_not_touched_by_the_timeout_sweep() {
        let config = Arc::new(HubConfig {
            cancel_timeout_secs: 1,
            ..HubConfig::default()
        });
        let (dispatcher, _registry, node_id) = {
            let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
            let registry = Arc::new(NodeRegistry::new(Arc::new(InMemoryNodeStore::new()), config.clone(), audit.clone()));
            let (tx, _rx) = mpsc::channel(16);
            let node_id = registry
                .register(
                    manlab_registry::RegisterRequest {
                        hostname: "node-1".to_string(),
                        os: "linux".to_string(),
                        agent_version: "1.0.0".to_string(),
                        ip: None,
                        primary_interface: None,
                        mac: None,
                        capabilities: Default::default(),
                        token: None,
                    },
                    tx,
                )
                .await
                .unwrap();
            let dispatcher = Dispatcher::new(Arc::new(InMemoryCommandStore::new()), registry.clone(), config, audit);
            (dispatcher, registry, node_id)
        };

        let id = dispatcher.enqueue(node_id, CommandType::Shell, serde_json::json!({"cmd": "uptime"})).await.unwrap();
        dispatcher.dispatch_ready(node_id).await.unwrap();
        dispatcher.cancel(id).await.unwrap();
        // The agent ACKs before the cancel timeout elapses.
        dispatcher.apply_status_report(id, CommandStatus::Cancelled, None, None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(dispatcher.sweep_cancel_timeouts().await.unwrap(), 0);
        assert_eq!(dispatcher.get(id).await.unwrap().unwrap().status, CommandStatus::Cancelled);
    }

    #[tokio::test]
    async fn service_status_refresh_coalesces_while_one_is_in_flight() {
        let (dispatcher, _registry, node_id) = setup().await;
        let first = dispatcher.enqueue_coalesced_service_status(node_id).await.unwrap();
        assert!(first);

        let second = dispatcher.enqueue_coalesced_service_status(node_id).await.unwrap();
        assert!(!second);
    }
}
