//! Monitor scheduling: cron-driven in-process probes (HTTP, traffic,
//! scheduled network tools) plus the interval-driven service-status
//! refresh.
//!
//! The probe families run directly on the hub and never touch the command
//! queue — they're the hub reaching out to a target, not the hub asking an
//! agent to do it. Service-status refresh is the opposite: it always goes
//! through [`Dispatcher`] and the agent's own reporting.
//!
//! Misfire policy is do-nothing: [`ScheduleSpec::is_due`] only asks "is the
//! next fire time at or before now", computed from `last_run_at`. A job
//! that was blocked through three missed periods does not replay three
//! runs — it runs once and resumes from `now`.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use manlab_config::HubConfig;
use manlab_dispatcher::Dispatcher;
use manlab_persist::{MonitorConfigRow, MonitorKind, MonitorStore, TelemetryStore};
use manlab_proto::{ManlabError, ManlabResult, NodeId, NodeStatus};
use manlab_registry::NodeRegistry;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// A parsed schedule: either a cron expression or a fixed interval,
/// depending on what `cron_or_interval` parses as. Cron takes precedence —
/// if it parses as a valid cron expression that's used; otherwise it's
/// interpreted as a plain integer interval in seconds.
pub enum ScheduleSpec {
    Cron(Schedule),
    IntervalSecs(i64),
}

impl ScheduleSpec {
    pub fn parse(spec: &str) -> ManlabResult<Self> {
        if let Ok(schedule) = Schedule::from_str(spec) {
            return Ok(Self::Cron(schedule));
        }
        spec.trim()
            .parse::<i64>()
            .map(Self::IntervalSecs)
            .map_err(|_| ManlabError::BadRequest(format!("invalid cron or interval: {spec}")))
    }

    fn is_due(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Cron(schedule) => {
                let after = last_run_at.unwrap_or(now - chrono::Duration::seconds(1));
                schedule.after(&after).next().is_some_and(|next| next <= now)
            }
            Self::IntervalSecs(secs) => {
                last_run_at.is_none_or(|last| now - last >= chrono::Duration::seconds(*secs))
            }
        }
    }
}

fn is_probe_interface(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !(lower == "lo" || lower.starts_with("tun") || lower.starts_with("docker") || lower.starts_with("veth"))
}

// ─── In-process probes (HTTP / traffic / network tool) ────────────────────────

/// Per-interface rx/tx byte counter baseline, keyed by (config, interface).
/// The first sample for a key only establishes the baseline and produces no
/// rate — matching the documented "first observation" behavior.
type TrafficBaseline = HashMap<(Uuid, String), (u64, u64, DateTime<Utc>)>;

pub struct MonitorRunner {
    store: Arc<dyn MonitorStore>,
    http_client: reqwest::Client,
    tls_connector: tokio_rustls::TlsConnector,
    traffic_baseline: Mutex<TrafficBaseline>,
    running: Mutex<HashSet<Uuid>>,
}

impl MonitorRunner {
    pub fn new(store: Arc<dyn MonitorStore>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .expect("reqwest client with static config always builds");

        let mut root_store = tokio_rustls::rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let tls_connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

        Self {
            store,
            http_client,
            tls_connector,
            traffic_baseline: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Open a bare TLS connection to `host:port` (no HTTP involved) purely
    /// to read the leaf certificate's `not_after` off the handshake. Used
    /// alongside the reqwest-driven request/response capture in
    /// `run_http_check`, since reqwest's rustls backend doesn't expose the
    /// peer certificate chain it validated against.
    async fn tls_leaf_not_after(&self, host: &str, port: u16) -> Option<DateTime<Utc>> {
        let server_name = rustls_pki_types::ServerName::try_from(host.to_string()).ok()?;
        let tcp = tokio::time::timeout(StdDuration::from_secs(10), tokio::net::TcpStream::connect((host, port)))
            .await
            .ok()?
            .ok()?;
        let tls_stream = self.tls_connector.connect(server_name, tcp).await.ok()?;
        let (_, session) = tls_stream.get_ref();
        let leaf = session.peer_certificates()?.first()?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
        let not_after = cert.validity().not_after.timestamp();
        DateTime::from_timestamp(not_after, 0)
    }

    /// Run one scheduling pass across the three cron-capable probe
    /// families. Returns how many probes actually executed (skips
    /// not-due configs and configs already mid-run).
    pub async fn tick(&self, now: DateTime<Utc>) -> ManlabResult<usize> {
        let mut ran = 0;
        for kind in [MonitorKind::Http, MonitorKind::Traffic, MonitorKind::ScheduledNetworkTool] {
            ran += self.tick_kind(kind, now).await?;
        }
        Ok(ran)
    }

    async fn tick_kind(&self, kind: MonitorKind, now: DateTime<Utc>) -> ManlabResult<usize> {
        let configs = self
            .store
            .list_enabled_configs(kind)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;

        let mut ran = 0;
        for config in configs {
            if !is_due(&config, now) {
                continue;
            }
            if !self.running.lock().insert(config.id) {
                // Disallow-concurrent-execution: a prior run of this exact
                // config is still in flight, so this tick is a no-op misfire.
                continue;
            }
            let result = self.run_probe(kind, &config, now).await;
            self.running.lock().remove(&config.id);
            result?;
            ran += 1;
        }
        Ok(ran)
    }

    async fn run_probe(&self, kind: MonitorKind, config: &MonitorConfigRow, now: DateTime<Utc>) -> ManlabResult<()> {
        let succeeded = match kind {
            MonitorKind::Http => self.run_http_check(config, now).await,
            MonitorKind::Traffic => self.run_traffic_sample(config, now).await,
            MonitorKind::ScheduledNetworkTool => self.run_network_tool(config, now).await,
            MonitorKind::ServiceMonitor => unreachable!("ServiceMonitor goes through Dispatcher, not MonitorRunner"),
        };
        self.store
            .mark_run(kind, config.id, now, succeeded)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        info!(config_id = %config.id, ?kind, succeeded, "monitor probe ran");
        Ok(())
    }

    /// Build a request honoring method/timeout, capture status, optional
    /// body-keyword match, and TLS leaf not-after (derived from a parallel
    /// TLS handshake for `https://` targets). Persist a check row with
    /// response time, status, match flag, and TLS days remaining. Success
    /// is an expected status (or default 2xx) and, if configured, a
    /// keyword match.
    async fn run_http_check(&self, config: &MonitorConfigRow, now: DateTime<Utc>) -> bool {
        let Some(url) = config.params.get("url").and_then(|v| v.as_str()) else {
            self.append_http_error(config.id, now, "missing url param").await;
            return false;
        };
        let method = config.params.get("method").and_then(|v| v.as_str()).unwrap_or("GET");
        let keyword = config.params.get("keyword").and_then(|v| v.as_str());
        let expected_status = config.params.get("expected_status").and_then(|v| v.as_u64()).map(|v| v as u16);

        let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
        let started = std::time::Instant::now();
        let response = self.http_client.request(method, url).send().await;
        let response_time_ms = started.elapsed().as_millis() as i64;

        match response {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let status_ok = match expected_status {
                    Some(expected) => status_code == expected,
                    None => resp.status().is_success(),
                };
                let body = resp.text().await.unwrap_or_default();
                let keyword_matched = keyword.map(|k| body.contains(k));
                let success = status_ok && keyword_matched.unwrap_or(true);
                let tls_days_remaining = self.tls_days_remaining(url, now).await;

                let fields = serde_json::json!({
                    "response_time_ms": response_time_ms,
                    "status_code": status_code,
                    "keyword_matched": keyword_matched,
                    "tls_days_remaining": tls_days_remaining,
                });
                let _ = self.store.append_http_check(config.id, now, fields).await;
                success
            }
            Err(e) => {
                self.append_http_error(config.id, now, &e.to_string()).await;
                false
            }
        }
    }

    /// Days remaining until the target's TLS leaf certificate expires, or
    /// `None` for a plain `http://` target or a handshake that fails for
    /// any reason — this is a best-effort enrichment, never the thing that
    /// decides probe success.
    async fn tls_days_remaining(&self, url: &str, now: DateTime<Utc>) -> Option<i64> {
        let parsed = reqwest::Url::parse(url).ok()?;
        if parsed.scheme() != "https" {
            return None;
        }
        let host = parsed.host_str()?;
        let port = parsed.port_or_known_default().unwrap_or(443);
        let not_after = self.tls_leaf_not_after(host, port).await?;
        Some((not_after - now).num_days())
    }

    async fn append_http_error(&self, config_id: Uuid, now: DateTime<Utc>, message: &str) {
        let fields = serde_json::json!({
            "response_time_ms": serde_json::Value::Null,
            "status_code": serde_json::Value::Null,
            "keyword_matched": serde_json::Value::Null,
            "tls_days_remaining": serde_json::Value::Null,
            "error": message,
        });
        let _ = self.store.append_http_check(config_id, now, fields).await;
    }

    /// Enumerate interfaces (skipping loopback/tunnel), compare current
    /// byte counters against the cached previous sample, and compute
    /// rx/tx bytes/sec. First observation per interface only seeds the
    /// baseline.
    async fn run_traffic_sample(&self, config: &MonitorConfigRow, now: DateTime<Utc>) -> bool {
        let networks = sysinfo::Networks::new_with_refreshed_list();
        let mut baseline = self.traffic_baseline.lock();
        let mut any_sampled = false;

        for (name, data) in networks.iter() {
            if !is_probe_interface(name) {
                continue;
            }
            let rx = data.total_received();
            let tx = data.total_transmitted();
            let key = (config.id, name.clone());

            if let Some((prev_rx, prev_tx, prev_at)) = baseline.get(&key).copied() {
                let elapsed = (now - prev_at).num_milliseconds().max(1) as f64 / 1000.0;
                let rx_rate = (rx.saturating_sub(prev_rx)) as f64 / elapsed;
                let tx_rate = (tx.saturating_sub(prev_tx)) as f64 / elapsed;
                let fields = serde_json::json!({
                    "interface_name": name,
                    "rx_bytes_per_sec": rx_rate,
                    "tx_bytes_per_sec": tx_rate,
                    "utilization_pct": serde_json::Value::Null,
                });
                let _ = self.store.append_traffic_sample(config.id, now, fields).await;
                any_sampled = true;
            }
            baseline.insert(key, (rx, tx, now));
        }
        any_sampled
    }

    /// Scheduled network tool runs (e.g. reachability probes): params name
    /// a `host`/`port` target and this dials a plain TCP connection,
    /// treating connect success as the tool's pass/fail signal.
    async fn run_network_tool(&self, config: &MonitorConfigRow, now: DateTime<Utc>) -> bool {
        let Some(host) = config.params.get("host").and_then(|v| v.as_str()) else {
            return false;
        };
        let port = config.params.get("port").and_then(|v| v.as_u64()).unwrap_or(443) as u16;
        let timeout_ms = config.params.get("timeout_ms").and_then(|v| v.as_u64()).unwrap_or(5_000);

        let addr = format!("{host}:{port}");
        let connect = tokio::time::timeout(
            StdDuration::from_millis(timeout_ms),
            tokio::net::TcpStream::connect(&addr),
        )
        .await;

        let (success, error) = match connect {
            Ok(Ok(_)) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("connect timed out".to_string())),
        };
        let fields = serde_json::json!({
            "response_time_ms": serde_json::Value::Null,
            "status_code": serde_json::Value::Null,
            "keyword_matched": serde_json::Value::Null,
            "tls_days_remaining": serde_json::Value::Null,
            "error": error,
        });
        let _ = self.store.append_http_check(config.id, now, fields).await;
        success
    }
}

fn is_due(config: &MonitorConfigRow, now: DateTime<Utc>) -> bool {
    match ScheduleSpec::parse(&config.cron_or_interval) {
        Ok(spec) => spec.is_due(config.last_run_at, now),
        Err(e) => {
            warn!(config_id = %config.id, error = %e, "unparseable monitor schedule, skipping");
            false
        }
    }
}

// ─── Command-enqueuing scheduler (service-status refresh) ─────────────────────

/// Fixed-interval refresh that only enqueues `ServiceStatus` commands, never
/// runs a probe itself. For each node with at least one enabled
/// `ServiceMonitor` config it enqueues a refresh when the node is online, no
/// `ServiceStatus` command is already in flight within the cooldown window,
/// and the newest snapshot is older than the configured minimum age.
pub struct ServiceStatusScheduler {
    monitor_store: Arc<dyn MonitorStore>,
    telemetry_store: Arc<dyn TelemetryStore>,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<HubConfig>,
}

impl ServiceStatusScheduler {
    pub fn new(
        monitor_store: Arc<dyn MonitorStore>,
        telemetry_store: Arc<dyn TelemetryStore>,
        registry: Arc<NodeRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<HubConfig>,
    ) -> Self {
        Self {
            monitor_store,
            telemetry_store,
            registry,
            dispatcher,
            config,
        }
    }

    /// Run one refresh pass. Returns how many nodes had a refresh enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> ManlabResult<usize> {
        let configs = self
            .monitor_store
            .list_enabled_configs(MonitorKind::ServiceMonitor)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;

        let mut candidate_nodes: HashSet<NodeId> = HashSet::new();
        for config in configs {
            candidate_nodes.insert(config.node_id);
        }

        let mut enqueued = 0;
        for node_id in candidate_nodes {
            if self.should_refresh(node_id, now).await? {
                let did_enqueue = self.dispatcher.enqueue_coalesced_service_status(node_id).await?;
                if did_enqueue {
                    enqueued += 1;
                }
            }
        }
        Ok(enqueued)
    }

    async fn should_refresh(&self, node_id: NodeId, now: DateTime<Utc>) -> ManlabResult<bool> {
        let Some(node) = self.registry.get(node_id).await? else {
            return Ok(false);
        };
        if node.status != NodeStatus::Online {
            return Ok(false);
        }

        let latest = self
            .telemetry_store
            .latest_opaque_snapshot("service_status_snapshots", node_id)
            .await
            .map_err(|e| ManlabError::Internal(e.to_string()))?;
        let min_age = chrono::Duration::seconds(self.config.service_status_min_snapshot_age_secs);
        Ok(latest.is_none_or(|ts| now - ts >= min_age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manlab_persist::{InMemoryAuditStore, InMemoryCommandStore, InMemoryMonitorStore, InMemoryNodeStore, InMemoryTelemetryStore};
    use manlab_proto::CapabilitiesDocument;

    #[test]
    fn interval_schedule_is_due_after_elapsed_window() {
        let spec = ScheduleSpec::parse("60").unwrap();
        let now = Utc::now();
        assert!(spec.is_due(None, now));
        assert!(!spec.is_due(Some(now - chrono::Duration::seconds(10)), now));
        assert!(spec.is_due(Some(now - chrono::Duration::seconds(90)), now));
    }

    #[test]
    fn cron_schedule_parses() {
        let spec = ScheduleSpec::parse("0 * * * * *").unwrap();
        assert!(matches!(spec, ScheduleSpec::Cron(_)));
    }

    #[test]
    fn garbage_schedule_is_rejected() {
        assert!(ScheduleSpec::parse("not a schedule").is_err());
    }

    #[tokio::test]
    async fn http_probe_records_a_failure_check_on_connection_error() {
        let store: Arc<dyn MonitorStore> = Arc::new(InMemoryMonitorStore::new());
        let runner = MonitorRunner::new(store.clone());
        let config = MonitorConfigRow {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            cron_or_interval: "30".to_string(),
            enabled: true,
            params: serde_json::json!({"url": "http://127.0.0.1:1"}),
            last_run_at: None,
            last_success_at: None,
        };
        store.upsert_config(MonitorKind::Http, &config).await.unwrap();

        let ran = runner.tick(Utc::now()).await.unwrap();
        assert_eq!(ran, 1);

        let checks = store.recent_http_checks(config.id, 10).await.unwrap();
        assert_eq!(checks.len(), 1);
    }

    #[tokio::test]
    async fn tls_days_remaining_is_none_for_a_plain_http_target() {
        let store: Arc<dyn MonitorStore> = Arc::new(InMemoryMonitorStore::new());
        let runner = MonitorRunner::new(store);
        assert_eq!(runner.tls_days_remaining("http://127.0.0.1:1", Utc::now()).await, None);
    }

    #[tokio::test]
    async fn concurrent_tick_does_not_double_run_the_same_config() {
        let store: Arc<dyn MonitorStore> = Arc::new(InMemoryMonitorStore::new());
        let runner = Arc::new(MonitorRunner::new(store.clone()));
        let config = MonitorConfigRow {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            cron_or_interval: "30".to_string(),
            enabled: true,
            params: serde_json::json!({"url": "http://127.0.0.1:1"}),
            last_run_at: None,
            last_success_at: None,
        };
        store.upsert_config(MonitorKind::Http, &config).await.unwrap();

        // Manually mark it as already running, the way an in-flight tick would.
        runner.running.lock().insert(config.id);
        let ran = runner.tick(Utc::now()).await.unwrap();
        assert_eq!(ran, 0, "a config already mid-run must be skipped, not double-run");
    }

    async fn setup_service_status_scheduler() -> (ServiceStatusScheduler, Arc<NodeRegistry>, NodeId) {
        let config = Arc::new(HubConfig::default());
        let audit = manlab_audit::AuditLogger::new(Arc::new(InMemoryAuditStore::new()));
        let registry = Arc::new(NodeRegistry::new(Arc::new(InMemoryNodeStore::new()), config.clone(), audit.clone()));
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

        let monitor_store: Arc<dyn MonitorStore> = Arc::new(InMemoryMonitorStore::new());
        let telemetry_store: Arc<dyn TelemetryStore> = Arc::new(InMemoryTelemetryStore::new());
        let command_store: Arc<dyn manlab_persist::CommandStore> = Arc::new(InMemoryCommandStore::new());
        let dispatcher = Arc::new(Dispatcher::new(command_store, registry.clone(), config.clone(), audit));

        monitor_store
            .upsert_config(
                MonitorKind::ServiceMonitor,
                &MonitorConfigRow {
                    id: Uuid::new_v4(),
                    node_id,
                    cron_or_interval: "30".to_string(),
                    enabled: true,
                    params: serde_json::json!({}),
                    last_run_at: None,
                    last_success_at: None,
                },
            )
            .await
            .unwrap();

        let scheduler = ServiceStatusScheduler::new(monitor_store, telemetry_store, registry.clone(), dispatcher, config);
        (scheduler, registry, node_id)
    }

    #[tokio::test]
    async fn refreshes_online_node_with_no_recent_snapshot() {
        let (scheduler, _registry, _node_id) = setup_service_status_scheduler().await;
        let enqueued = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(enqueued, 1);
    }

    #[tokio::test]
    async fn skips_node_with_a_fresh_snapshot() {
        let (scheduler, _registry, node_id) = setup_service_status_scheduler().await;
        scheduler
            .telemetry_store
            .record_opaque_snapshot("service_status_snapshots", node_id, Utc::now(), serde_json::json!({}))
            .await
            .unwrap();

        let enqueued = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(enqueued, 0);
    }

    #[tokio::test]
    async fn skips_offline_node() {
        let (scheduler, registry, node_id) = setup_service_status_scheduler().await;
        registry.disconnect(node_id).await.unwrap();

        let enqueued = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(enqueued, 0);
    }
}
