use async_trait::async_trait;
use chrono::Utc;
use manlab_proto::{CapabilitiesDocument, Node, NodeId, NodeStatus};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::PersistResult;

/// The durable store behind the node registry.
///
/// `upsert` is used both on registration and on every status/last-seen
/// mutation; `Node`s are never deleted implicitly, only by `delete`.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn upsert(&self, node: &Node) -> PersistResult<()>;
    async fn get(&self, id: NodeId) -> PersistResult<Option<Node>>;
    async fn list(&self) -> PersistResult<Vec<Node>>;
    async fn set_status(&self, id: NodeId, status: NodeStatus) -> PersistResult<()>;
    async fn delete(&self, id: NodeId) -> PersistResult<()>;
}

// ─── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgNodeStore {
    pool: PgPool,
}

impl PgNodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: uuid::Uuid,
    hostname: String,
    ip: Option<String>,
    os: String,
    agent_version: String,
    last_seen: chrono::DateTime<Utc>,
    status: String,
    capabilities: serde_json::Value,
    primary_interface: Option<String>,
    mac: Option<String>,
}

impl NodeRow {
    fn into_node(self) -> Node {
        Node {
            id: self.id,
            hostname: self.hostname,
            ip: self.ip,
            os: self.os,
            agent_version: self.agent_version,
            last_seen: self.last_seen,
            status: parse_status(&self.status),
            capabilities: serde_json::from_value(self.capabilities).unwrap_or_default(),
            primary_interface: self.primary_interface,
            mac: self.mac,
        }
    }
}

fn status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Online => "online",
        NodeStatus::Offline => "offline",
        NodeStatus::Unknown => "unknown",
    }
}

fn parse_status(s: &str) -> NodeStatus {
    match s {
        "online" => NodeStatus::Online,
        "offline" => NodeStatus::Offline,
        _ => NodeStatus::Unknown,
    }
}

#[async_trait]
impl NodeStore for PgNodeStore {
    async fn upsert(&self, node: &Node) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (id, hostname, ip, os, agent_version, last_seen, status, capabilities, primary_interface, mac)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                ip = EXCLUDED.ip,
                os = EXCLUDED.os,
                agent_version = EXCLUDED.agent_version,
                last_seen = EXCLUDED.last_seen,
                status = EXCLUDED.status,
                capabilities = EXCLUDED.capabilities,
                primary_interface = EXCLUDED.primary_interface,
                mac = EXCLUDED.mac
            "#,
        )
        .bind(node.id)
        .bind(&node.hostname)
        .bind(&node.ip)
        .bind(&node.os)
        .bind(&node.agent_version)
        .bind(node.last_seen)
        .bind(status_str(node.status))
        .bind(serde_json::to_value(&node.capabilities).unwrap_or_default())
        .bind(&node.primary_interface)
        .bind(&node.mac)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: NodeId) -> PersistResult<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(NodeRow::into_node))
    }

    async fn list(&self) -> PersistResult<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY hostname")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(NodeRow::into_node).collect())
    }

    async fn set_status(&self, id: NodeId, status: NodeStatus) -> PersistResult<()> {
        sqlx::query("UPDATE nodes SET status = $1, last_seen = last_seen WHERE id = $2")
            .bind(status_str(status))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: NodeId) -> PersistResult<()> {
        sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ─── In-memory (tests, no DATABASE_URL) ───────────────────────────────────────

#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: Mutex<HashMap<NodeId, Node>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn upsert(&self, node: &Node) -> PersistResult<()> {
        self.nodes.lock().insert(node.id, node.clone());
        Ok(())
    }

    async fn get(&self, id: NodeId) -> PersistResult<Option<Node>> {
        Ok(self.nodes.lock().get(&id).cloned())
    }

    async fn list(&self) -> PersistResult<Vec<Node>> {
        Ok(self.nodes.lock().values().cloned().collect())
    }

    async fn set_status(&self, id: NodeId, status: NodeStatus) -> PersistResult<()> {
        if let Some(node) = self.nodes.lock().get_mut(&id) {
            node.status = status;
        }
        Ok(())
    }

    async fn delete(&self, id: NodeId) -> PersistResult<()> {
        self.nodes.lock().remove(&id);
        Ok(())
    }
}
