//! Append-only audit trail for actions the hub takes against fleet state.
//!
//! Every command dispatch, cancellation, session grant, and policy change
//! is logged here. Unlike a tamper-evidence ledger, records are plain rows:
//! nothing here depends on a hash chain, so a single missing or reordered
//! record doesn't invalidate the rest of the log.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use manlab_persist::{AuditEventRow, AuditStore};
use manlab_proto::ManlabResult;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Coarse category of an audited action, used to partition the dashboard's
/// audit log view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Node,
    Command,
    Session,
    Monitor,
    Policy,
    Auth,
}

impl AuditKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Command => "command",
            Self::Session => "session",
            Self::Monitor => "monitor",
            Self::Policy => "policy",
            Self::Auth => "auth",
        }
    }
}

/// A single audited action. `event_name` is a free-form identifier
/// (`"command_enqueued"`, `"node_registration_rejected"`, ...) rather than
/// a closed enum, since new event names are cheap to add and don't need a
/// schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditKind,
    pub event_name: String,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub success: bool,
    pub data: serde_json::Value,
    pub recorded_at: chrono::DateTime<Utc>,
}

impl From<AuditEventRow> for AuditEvent {
    fn from(r: AuditEventRow) -> Self {
        let kind = match r.kind.as_str() {
            "node" => AuditKind::Node,
            "command" => AuditKind::Command,
            "session" => AuditKind::Session,
            "monitor" => AuditKind::Monitor,
            "policy" => AuditKind::Policy,
            _ => AuditKind::Auth,
        };
        AuditEvent {
            id: r.id,
            kind,
            event_name: r.event_name,
            actor_id: r.actor_id,
            target_id: r.target_id,
            success: r.success,
            data: r.data,
            recorded_at: r.recorded_at,
        }
    }
}

/// Thin wrapper over [`AuditStore`] that fills in id/timestamp and logs
/// every append at `info` level, the way a production audit path should
/// never fail silently.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        kind: AuditKind,
        event_name: &str,
        actor_id: Option<&str>,
        target_id: Option<&str>,
        success: bool,
        data: serde_json::Value,
    ) -> ManlabResult<Uuid> {
        let row = AuditEventRow {
            id: Uuid::new_v4(),
            kind: kind.as_str().to_string(),
            event_name: event_name.to_string(),
            actor_id: actor_id.map(str::to_string),
            target_id: target_id.map(str::to_string),
            success,
            data,
            recorded_at: Utc::now(),
        };
        self.store
            .append(&row)
            .await
            .map_err(|e| manlab_proto::ManlabError::Internal(e.to_string()))?;
        info!(
            id = %row.id,
            kind = kind.as_str(),
            event = event_name,
            success,
            "audit event recorded"
        );
        Ok(row.id)
    }

    pub async fn recent(&self, limit: i64) -> ManlabResult<Vec<AuditEvent>> {
        Ok(self
            .store
            .list_recent(limit)
            .await
            .map_err(|e| manlab_proto::ManlabError::Internal(e.to_string()))?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    pub async fn for_target(&self, target_id: &str, limit: i64) -> ManlabResult<Vec<AuditEvent>> {
        Ok(self
            .store
            .list_for_target(target_id, limit)
            .await
            .map_err(|e| manlab_proto::ManlabError::Internal(e.to_string()))?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manlab_persist::InMemoryAuditStore;

    #[tokio::test]
    async fn record_then_list_recent() {
        let logger = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        logger
            .record(
                AuditKind::Command,
                "command_enqueued",
                Some("dashboard-1"),
                Some("node-123"),
                true,
                serde_json::json!({"command_type": "docker_restart"}),
            )
            .await
            .unwrap();

        let events = logger.recent(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "command_enqueued");
    }

    #[tokio::test]
    async fn for_target_filters_to_that_node() {
        let logger = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        logger
            .record(AuditKind::Node, "node_registered", None, Some("node-a"), true, serde_json::json!({}))
            .await
            .unwrap();
        logger
            .record(AuditKind::Node, "node_registered", None, Some("node-b"), true, serde_json::json!({}))
            .await
            .unwrap();

        let events = logger.for_target("node-a", 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
