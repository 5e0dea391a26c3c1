//! Heartbeat ingestion, roll-up history queries, and the process-alert
//! pipeline.
//!
//! Ingestion is a thin wrapper over [`TelemetryStore`]; the interesting part
//! is the alert pipeline: [`ProcessAlertEvaluator`] applies per-node
//! thresholds to a heartbeat's `TopProcesses` list with a cooldown table
//! keyed by `(node, pid, kind)`, the same threshold/decision split
//! `AutoHealEngine` uses for fleet health scoring.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use manlab_config::HubConfig;
use manlab_persist::{RollupGranularity, TelemetryStore};
use manlab_proto::{DashboardEvent, ManlabError, ManlabResult, NodeId};
use manlab_registry::NodeRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ─── Ingestion ──────────────────────────────────────────────────────────────

pub struct TelemetryService {
    store: Arc<dyn TelemetryStore>,
    registry: Arc<NodeRegistry>,
}

impl TelemetryService {
    pub fn new(store: Arc<dyn TelemetryStore>, registry: Arc<NodeRegistry>) -> Self {
        Self { store, registry }
    }

    /// Record a heartbeat sample and refresh the node's liveness state.
    pub async fn ingest(&self, node_id: NodeId, recorded_at: DateTime<Utc>, sample: serde_json::Value) -> ManlabResult<()> {
        self.store
            .record_sample(node_id, recorded_at, sample)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        self.registry.record_heartbeat(node_id).await
    }

    pub async fn record_opaque_snapshot(
        &self,
        table: &str,
        node_id: NodeId,
        recorded_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> ManlabResult<()> {
        self.store
            .record_opaque_snapshot(table, node_id, recorded_at, payload)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }

    pub async fn history(
        &self,
        node_id: NodeId,
        since: DateTime<Utc>,
        granularity: RollupGranularity,
        metric_name: &str,
    ) -> ManlabResult<Vec<manlab_persist::HistoryBucket>> {
        let metric = metric_name.to_string();
        let extractor = move |v: &serde_json::Value| v.get(&metric).and_then(|x| x.as_f64());
        self.store
            .history(node_id, since, granularity, &extractor, metric_name)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))
    }
}

// ─── Process alerts ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cpu_pct: f32,
    pub mem_pct: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessAlertKind {
    CpuHigh,
    MemoryHigh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessAlertThresholds {
    pub cpu_pct: f32,
    pub mem_pct: f32,
}

impl Default for ProcessAlertThresholds {
    fn default() -> Self {
        Self { cpu_pct: 90.0, mem_pct: 90.0 }
    }
}

/// What the hub publishes onto the internal bus when a heartbeat carries a
/// `TopProcesses` list; the evaluator consumes these.
#[derive(Debug, Clone)]
pub struct ProcessAlertContext {
    pub node_id: NodeId,
    pub processes: Vec<ProcessSample>,
    pub thresholds: ProcessAlertThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessAlert {
    pub node_id: NodeId,
    pub pid: u32,
    pub process_name: String,
    pub kind: ProcessAlertKind,
    pub value: f32,
    pub threshold: f32,
    pub raised_at: DateTime<Utc>,
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &ProcessAlert);
}

/// Default notifier: structured log line, no external dependency required.
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &ProcessAlert) {
        warn!(
            node_id = %alert.node_id,
            pid = alert.pid,
            process = %alert.process_name,
            ?alert.kind,
            value = alert.value,
            threshold = alert.threshold,
            "process alert"
        );
    }
}

/// Posts a JSON payload to a Discord-compatible incoming webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self { client: reqwest::Client::new(), webhook_url }
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, alert: &ProcessAlert) {
        let content = format!(
            "process alert: node={} pid={} ({}) {:?} {:.1} > {:.1}",
            alert.node_id, alert.pid, alert.process_name, alert.kind, alert.value, alert.threshold
        );
        let body = serde_json::json!({ "content": content });
        if let Err(e) = self.client.post(&self.webhook_url).json(&body).send().await {
            warn!(error = %e, "failed to deliver process alert webhook");
        }
    }
}

/// Evaluates [`ProcessAlertContext`]s against per-node thresholds, applying
/// a cooldown per `(node, pid, kind)` so a process pinned above a threshold
/// doesn't re-alert every heartbeat. The cooldown table is capped; once full
/// the oldest entry is evicted to admit a new one, bounding memory growth
/// under a large or pathological fleet.
pub struct ProcessAlertEvaluator {
    config: Arc<HubConfig>,
    registry: Arc<NodeRegistry>,
    notifier: Arc<dyn AlertNotifier>,
    cooldowns: Mutex<HashMap<(NodeId, u32, ProcessAlertKind), DateTime<Utc>>>,
}

impl ProcessAlertEvaluator {
    pub fn new(config: Arc<HubConfig>, registry: Arc<NodeRegistry>, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self {
            config,
            registry,
            notifier,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one heartbeat's process list, publish alerts to the
    /// dashboard group, and hand each to the notifier. Returns the alerts
    /// actually raised (cooldown-suppressed repeats are not returned).
    pub async fn evaluate(&self, ctx: ProcessAlertContext, now: DateTime<Utc>) -> Vec<ProcessAlert> {
        let mut raised = Vec::new();
        for process in &ctx.processes {
            if let Some(alert) = self.check_one(&ctx, process, ProcessAlertKind::CpuHigh, process.cpu_pct, ctx.thresholds.cpu_pct, now) {
                raised.push(alert);
            }
            if let Some(alert) = self.check_one(&ctx, process, ProcessAlertKind::MemoryHigh, process.mem_pct, ctx.thresholds.mem_pct, now) {
                raised.push(alert);
            }
        }

        if !raised.is_empty() {
            self.registry.publish_process_alerts(ctx.node_id, &raised);
            for alert in &raised {
                self.notifier.notify(alert).await;
            }
            info!(node_id = %ctx.node_id, count = raised.len(), "process alerts raised");
        }
        raised
    }

    fn check_one(
        &self,
        ctx: &ProcessAlertContext,
        process: &ProcessSample,
        kind: ProcessAlertKind,
        value: f32,
        threshold: f32,
        now: DateTime<Utc>,
    ) -> Option<ProcessAlert> {
        if value < threshold {
            return None;
        }
        let key = (ctx.node_id, process.pid, kind);
        let mut cooldowns = self.cooldowns.lock();
        if let Some(last) = cooldowns.get(&key) {
            let elapsed = now - *last;
            if elapsed < chrono::Duration::seconds(self.config.process_alert_cooldown_secs) {
                return None;
            }
        }

        if cooldowns.len() >= self.config.process_alert_cooldown_cap && !cooldowns.contains_key(&key) {
            if let Some(oldest_key) = cooldowns.iter().min_by_key(|(_, ts)| **ts).map(|(k, _)| *k) {
                cooldowns.remove(&oldest_key);
            }
        }
        cooldowns.insert(key, now);

        Some(ProcessAlert {
            node_id: ctx.node_id,
            pid: process.pid,
            process_name: process.name.clone(),
            kind,
            value,
            threshold,
            raised_at: now,
        })
    }

    /// Drop cooldown entries that have fully expired, independent of the
    /// capacity-triggered eviction in [`check_one`]. Run periodically
    /// alongside the other hub sweeps.
    pub fn sweep_expired_cooldowns(&self, now: DateTime<Utc>) -> usize {
        let cutoff = chrono::Duration::seconds(self.config.process_alert_cooldown_secs);
        let mut cooldowns = self.cooldowns.lock();
        let before = cooldowns.len();
        cooldowns.retain(|_, ts| now - *ts < cutoff);
        before - cooldowns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manlab_audit::AuditLogger;
    use manlab_persist::{InMemoryAuditStore, InMemoryNodeStore, InMemoryTelemetryStore};
    use manlab_proto::CapabilitiesDocument;

    async fn setup() -> (TelemetryService, Arc<NodeRegistry>, NodeId) {
        let config = Arc::new(HubConfig::default());
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        let registry = Arc::new(NodeRegistry::new(Arc::new(InMemoryNodeStore::new()), config.clone(), audit));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let node_id = registry
            .register(
                manlab_registry::RegisterRequest {
                    hostname: "node-1".to_string(),
                    os: "linux".to_string(),
                    agent_version: "1.0.0".to_string(),
                    ip: None,
                    primary_interface: None,
                    mac: None,
                    capabilities: CapabilitiesDocument::default(),
                    token: None,
                },
                tx,
            )
            .await
            .unwrap();
        let store: Arc<dyn TelemetryStore> = Arc::new(InMemoryTelemetryStore::new());
        let service = TelemetryService::new(store, registry.clone());
        (service, registry, node_id)
    }

    #[tokio::test]
    async fn ingest_records_sample_and_refreshes_heartbeat() {
        let (service, registry, node_id) = setup().await;
        service.ingest(node_id, Utc::now(), serde_json::json!({"cpu": 42.0})).await.unwrap();
        let node = registry.get(node_id).await.unwrap().unwrap();
        assert_eq!(node.status, manlab_proto::NodeStatus::Online);
    }

    #[tokio::test]
    async fn history_reads_back_ingested_samples() {
        let (service, _registry, node_id) = setup().await;
        let base = Utc::now();
        for i in 0..3 {
            service
                .ingest(node_id, base + chrono::Duration::seconds(i), serde_json::json!({"cpu": (i * 10) as f64}))
                .await
                .unwrap();
        }
        let buckets = service
            .history(node_id, base - chrono::Duration::seconds(1), RollupGranularity::Raw, "cpu")
            .await
            .unwrap();
        assert_eq!(buckets.len(), 3);
    }

    struct RecordingNotifier {
        calls: Mutex<Vec<ProcessAlert>>,
    }

    #[async_trait]
    impl AlertNotifier for RecordingNotifier {
        async fn notify(&self, alert: &ProcessAlert) {
            self.calls.lock().push(alert.clone());
        }
    }

    fn evaluator(registry: Arc<NodeRegistry>) -> (Arc<RecordingNotifier>, ProcessAlertEvaluator) {
        let notifier = Arc::new(RecordingNotifier { calls: Mutex::new(Vec::new()) });
        let config = Arc::new(HubConfig::default());
        let eval = ProcessAlertEvaluator::new(config, registry, notifier.clone());
        (notifier, eval)
    }

    fn ctx(node_id: NodeId) -> ProcessAlertContext {
        ProcessAlertContext {
            node_id,
            processes: vec![ProcessSample { pid: 100, name: "stress".to_string(), cpu_pct: 99.0, mem_pct: 10.0 }],
            thresholds: ProcessAlertThresholds::default(),
        }
    }

    #[tokio::test]
    async fn process_over_threshold_raises_one_alert() {
        let (_service, registry, node_id) = setup().await;
        let (notifier, eval) = evaluator(registry);
        let alerts = eval.evaluate(ctx(node_id), Utc::now()).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, ProcessAlertKind::CpuHigh);
        assert_eq!(notifier.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn repeat_alert_within_cooldown_is_suppressed() {
        let (_service, registry, node_id) = setup().await;
        let (notifier, eval) = evaluator(registry);
        let now = Utc::now();
        eval.evaluate(ctx(node_id), now).await;
        let second = eval.evaluate(ctx(node_id), now + chrono::Duration::seconds(1)).await;
        assert!(second.is_empty());
        assert_eq!(notifier.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn alert_fires_again_after_cooldown_elapses() {
        let (_service, registry, node_id) = setup().await;
        let (_, eval) = evaluator(registry);
        let now = Utc::now();
        eval.evaluate(ctx(node_id), now).await;
        let later = now + chrono::Duration::seconds(eval.config.process_alert_cooldown_secs + 1);
        let second = eval.evaluate(ctx(node_id), later).await;
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn sweep_expired_cooldowns_removes_stale_entries() {
        let config = Arc::new(HubConfig { process_alert_cooldown_secs: 10, ..HubConfig::default() });
        let audit = AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        let registry = Arc::new(NodeRegistry::new(Arc::new(InMemoryNodeStore::new()), config.clone(), audit));
        let notifier = Arc::new(LogNotifier);
        let eval = ProcessAlertEvaluator::new(config, registry, notifier);
        let node_id = uuid::Uuid::new_v4();
        let now = Utc::now();
        eval.cooldowns.lock().insert((node_id, 1, ProcessAlertKind::CpuHigh), now - chrono::Duration::seconds(20));
        let removed = eval.sweep_expired_cooldowns(now);
        assert_eq!(removed, 1);
    }
}
