use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manlab_proto::{CommandId, CommandQueueItem, CommandStatus, CommandType, NodeId};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::PersistResult;

/// The durable command queue.
///
/// `transition` is the optimistic-concurrency primitive the dispatcher
/// builds its state machine on: it only succeeds if the row is still in
/// `expected_from`, giving short transactions plus optimistic concurrency
/// on the command row via status preconditions.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn enqueue(&self, item: &CommandQueueItem) -> PersistResult<()>;
    async fn get(&self, id: CommandId) -> PersistResult<Option<CommandQueueItem>>;
    async fn list_for_node(&self, node_id: NodeId, limit: i64) -> PersistResult<Vec<CommandQueueItem>>;
    /// FIFO by created_at, ties broken by id — the dispatch-loop scan order.
    async fn list_queued_for_node(&self, node_id: NodeId) -> PersistResult<Vec<CommandQueueItem>>;
    async fn transition(
        &self,
        id: CommandId,
        expected_from: CommandStatus,
        to: CommandStatus,
        sent_at: Option<DateTime<Utc>>,
        executed_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> PersistResult<bool>;
    async fn append_output(&self, id: CommandId, chunk: &str, cap_bytes: usize) -> PersistResult<()>;
    async fn list_sent_older_than(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<CommandQueueItem>>;
    /// Count of `ServiceStatus` commands for `node_id` in a non-terminal
    /// state created after `cooldown_cutoff` — backs refresh coalescing.
    async fn count_active_service_status(
        &self,
        node_id: NodeId,
        cooldown_cutoff: DateTime<Utc>,
    ) -> PersistResult<i64>;
}

pub(crate) fn append_bounded(existing: &str, chunk: &str, cap_bytes: usize) -> (String, bool) {
    if existing.len() >= cap_bytes {
        return (existing.to_string(), true);
    }
    let mut combined = String::with_capacity(existing.len() + chunk.len());
    combined.push_str(existing);
    combined.push_str(chunk);
    if combined.len() > cap_bytes {
        combined.truncate(cap_bytes);
        combined.push_str("\n...[truncated]");
        (combined, true)
    } else {
        (combined, false)
    }
}

// ─── Postgres ─────────────────────────────────────────────────────────────────

pub struct PgCommandStore {
    pool: PgPool,
}

impl PgCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CommandRow {
    id: uuid::Uuid,
    node_id: uuid::Uuid,
    command_type: String,
    payload: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    output_log: String,
    output_truncated: bool,
    error: Option<String>,
}

impl CommandRow {
    fn into_item(self) -> CommandQueueItem {
        CommandQueueItem {
            id: self.id,
            node_id: self.node_id,
            command_type: CommandType::parse(&self.command_type).unwrap_or(CommandType::Shell),
            payload: self.payload,
            status: parse_status(&self.status),
            created_at: self.created_at,
            sent_at: self.sent_at,
            executed_at: self.executed_at,
            output_log: self.output_log,
            output_truncated: self.output_truncated,
            error: self.error,
        }
    }
}

fn status_str(s: CommandStatus) -> &'static str {
    match s {
        CommandStatus::Queued => "queued",
        CommandStatus::Sent => "sent",
        CommandStatus::InProgress => "in_progress",
        CommandStatus::Success => "success",
        CommandStatus::Failed => "failed",
        CommandStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> CommandStatus {
    match s {
        "queued" => CommandStatus::Queued,
        "sent" => CommandStatus::Sent,
        "in_progress" => CommandStatus::InProgress,
        "success" => CommandStatus::Success,
        "failed" => CommandStatus::Failed,
        _ => CommandStatus::Cancelled,
    }
}

#[async_trait]
impl CommandStore for PgCommandStore {
    async fn enqueue(&self, item: &CommandQueueItem) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO command_queue (id, node_id, command_type, payload, status, created_at, sent_at, executed_at, output_log, output_truncated, error)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            "#,
        )
        .bind(item.id)
        .bind(item.node_id)
        .bind(item.command_type.wire_name())
        .bind(&item.payload)
        .bind(status_str(item.status))
        .bind(item.created_at)
        .bind(item.sent_at)
        .bind(item.executed_at)
        .bind(&item.output_log)
        .bind(item.output_truncated)
        .bind(&item.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: CommandId) -> PersistResult<Option<CommandQueueItem>> {
        let row = sqlx::query_as::<_, CommandRow>("SELECT * FROM command_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(CommandRow::into_item))
    }

    async fn list_for_node(&self, node_id: NodeId, limit: i64) -> PersistResult<Vec<CommandQueueItem>> {
        let rows = sqlx::query_as::<_, CommandRow>(
            "SELECT * FROM command_queue WHERE node_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(node_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CommandRow::into_item).collect())
    }

    async fn list_queued_for_node(&self, node_id: NodeId) -> PersistResult<Vec<CommandQueueItem>> {
        let rows = sqlx::query_as::<_, CommandRow>(
            "SELECT * FROM command_queue WHERE node_id = $1 AND status = 'queued' ORDER BY created_at ASC, id ASC",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CommandRow::into_item).collect())
    }

    async fn transition(
        &self,
        id: CommandId,
        expected_from: CommandStatus,
        to: CommandStatus,
        sent_at: Option<DateTime<Utc>>,
        executed_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> PersistResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE command_queue
            SET status = $1,
                sent_at = COALESCE($2, sent_at),
                executed_at = COALESCE($3, executed_at),
                error = COALESCE($4, error)
            WHERE id = $5 AND status = $6
            "#,
        )
        .bind(status_str(to))
        .bind(sent_at)
        .bind(executed_at)
        .bind(error)
        .bind(id)
        .bind(status_str(expected_from))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_output(&self, id: CommandId, chunk: &str, cap_bytes: usize) -> PersistResult<()> {
        let Some(current) = self.get(id).await? else {
            return Ok(());
        };
        let (combined, truncated) = append_bounded(&current.output_log, chunk, cap_bytes);
        sqlx::query("UPDATE command_queue SET output_log = $1, output_truncated = $2 WHERE id = $3")
            .bind(combined)
            .bind(truncated || current.output_truncated)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_sent_older_than(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<CommandQueueItem>> {
        let rows = sqlx::query_as::<_, CommandRow>(
            "SELECT * FROM command_queue WHERE status = 'sent' AND sent_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CommandRow::into_item).collect())
    }

    async fn count_active_service_status(
        &self,
        node_id: NodeId,
        cooldown_cutoff: DateTime<Utc>,
    ) -> PersistResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM command_queue
            WHERE node_id = $1 AND command_type = 'service.status'
              AND status IN ('queued', 'sent', 'in_progress')
              AND created_at > $2
            "#,
        )
        .bind(node_id)
        .bind(cooldown_cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ─── In-memory (tests, no DATABASE_URL) ───────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCommandStore {
    items: Mutex<HashMap<CommandId, CommandQueueItem>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn enqueue(&self, item: &CommandQueueItem) -> PersistResult<()> {
        self.items.lock().insert(item.id, item.clone());
        Ok(())
    }

    async fn get(&self, id: CommandId) -> PersistResult<Option<CommandQueueItem>> {
        Ok(self.items.lock().get(&id).cloned())
    }

    async fn list_for_node(&self, node_id: NodeId, limit: i64) -> PersistResult<Vec<CommandQueueItem>> {
        let mut items: Vec<_> = self
            .items
            .lock()
            .values()
            .filter(|i| i.node_id == node_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| std::cmp::Reverse(i.created_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn list_queued_for_node(&self, node_id: NodeId) -> PersistResult<Vec<CommandQueueItem>> {
        let mut items: Vec<_> = self
            .items
            .lock()
            .values()
            .filter(|i| i.node_id == node_id && i.status == CommandStatus::Queued)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.created_at, i.id));
        Ok(items)
    }

    async fn transition(
        &self,
        id: CommandId,
        expected_from: CommandStatus,
        to: CommandStatus,
        sent_at: Option<DateTime<Utc>>,
        executed_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> PersistResult<bool> {
        let mut items = self.items.lock();
        let Some(item) = items.get_mut(&id) else {
            return Ok(false);
        };
        if item.status != expected_from {
            return Ok(false);
        }
        item.status = to;
        if let Some(sent_at) = sent_at {
            item.sent_at = Some(sent_at);
        }
        if let Some(executed_at) = executed_at {
            item.executed_at = Some(executed_at);
        }
        if let Some(error) = error {
            item.error = Some(error.to_string());
        }
        Ok(true)
    }

    async fn append_output(&self, id: CommandId, chunk: &str, cap_bytes: usize) -> PersistResult<()> {
        let mut items = self.items.lock();
        if let Some(item) = items.get_mut(&id) {
            let (combined, truncated) = append_bounded(&item.output_log, chunk, cap_bytes);
            item.output_log = combined;
            item.output_truncated = item.output_truncated || truncated;
        }
        Ok(())
    }

    async fn list_sent_older_than(&self, cutoff: DateTime<Utc>) -> PersistResult<Vec<CommandQueueItem>> {
        Ok(self
            .items
            .lock()
            .values()
            .filter(|i| i.status == CommandStatus::Sent && i.sent_at.is_some_and(|s| s < cutoff))
            .cloned()
            .collect())
    }

    async fn count_active_service_status(
        &self,
        node_id: NodeId,
        cooldown_cutoff: DateTime<Utc>,
    ) -> PersistResult<i64> {
        Ok(self
            .items
            .lock()
            .values()
            .filter(|i| {
                i.node_id == node_id
                    && i.command_type == CommandType::ServiceStatus
                    && !i.status.is_terminal()
                    && i.created_at > cooldown_cutoff
            })
            .count() as i64)
    }
}
