use std::sync::Arc;

use manlab_audit::AuditLogger;
use manlab_cleanup::MemoryPressureMonitor;
use manlab_config::HubConfig;
use manlab_dispatcher::Dispatcher;
use manlab_persist::{CommandStore, MonitorStore, SessionStore, SettingsStore, TelemetryStore};
use manlab_registry::NodeRegistry;
use manlab_scheduler::{MonitorRunner, ServiceStatusScheduler};
use manlab_sessions::{DownloadSessionRegistry, EphemeralSessionRegistry, PolicyRegistry, TerminalSessionRegistry};
use manlab_streaming::StreamRegistry;
use manlab_telemetry::{AlertNotifier, ProcessAlertEvaluator, TelemetryService};

/// Everything a websocket handler or REST route needs, cloned cheaply
/// (every field is an `Arc`) into each request/connection task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub audit: AuditLogger,
    pub registry: Arc<NodeRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub streams: Arc<StreamRegistry>,
    pub terminal_sessions: Arc<TerminalSessionRegistry>,
    pub ephemeral_sessions: Arc<EphemeralSessionRegistry>,
    pub download_sessions: Arc<DownloadSessionRegistry>,
    pub policies: Arc<PolicyRegistry>,
    pub monitor_runner: Arc<MonitorRunner>,
    pub service_status_scheduler: Arc<ServiceStatusScheduler>,
    pub telemetry: Arc<TelemetryService>,
    pub process_alerts: Arc<ProcessAlertEvaluator>,
    pub memory_pressure: Arc<MemoryPressureMonitor>,
    pub settings: Arc<dyn SettingsStore>,
}

pub struct Stores {
    pub node: Arc<dyn manlab_persist::NodeStore>,
    pub command: Arc<dyn CommandStore>,
    pub session: Arc<dyn SessionStore>,
    pub monitor: Arc<dyn MonitorStore>,
    pub telemetry: Arc<dyn TelemetryStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub audit: Arc<dyn manlab_persist::AuditStore>,
}

/// Select the Postgres-backed store family if a pool connected, otherwise
/// the in-memory family — mirrors `manlab_persist::connect_optional`'s
/// `DATABASE_URL`-optional convention.
pub fn build_stores(pool: Option<sqlx::PgPool>) -> Stores {
    match pool {
        Some(pool) => Stores {
            node: Arc::new(manlab_persist::PgNodeStore::new(pool.clone())),
            command: Arc::new(manlab_persist::PgCommandStore::new(pool.clone())),
            session: Arc::new(manlab_persist::PgSessionStore::new(pool.clone())),
            monitor: Arc::new(manlab_persist::PgMonitorStore::new(pool.clone())),
            telemetry: Arc::new(manlab_persist::PgTelemetryStore::new(pool.clone())),
            settings: Arc::new(manlab_persist::PgSettingsStore::new(pool.clone())),
            audit: Arc::new(manlab_persist::PgAuditStore::new(pool)),
        },
        None => Stores {
            node: Arc::new(manlab_persist::InMemoryNodeStore::new()),
            command: Arc::new(manlab_persist::InMemoryCommandStore::new()),
            session: Arc::new(manlab_persist::InMemorySessionStore::new()),
            monitor: Arc::new(manlab_persist::InMemoryMonitorStore::new()),
            telemetry: Arc::new(manlab_persist::InMemoryTelemetryStore::new()),
            settings: Arc::new(manlab_persist::InMemorySettingsStore::new()),
            audit: Arc::new(manlab_persist::InMemoryAuditStore::new()),
        },
    }
}

impl AppState {
    pub fn build(config: Arc<HubConfig>, stores: Stores, notifier: Arc<dyn AlertNotifier>) -> Self {
        let audit = AuditLogger::new(stores.audit);
        let registry = Arc::new(NodeRegistry::new(stores.node, config.clone(), audit.clone()));
        let dispatcher = Arc::new(Dispatcher::new(stores.command, registry.clone(), config.clone(), audit.clone()));
        let streams = Arc::new(StreamRegistry::new(config.clone()));
        let terminal_sessions = Arc::new(TerminalSessionRegistry::new(stores.session.clone(), config.clone(), audit.clone()));
        let ephemeral_sessions = Arc::new(EphemeralSessionRegistry::new(config.clone()));
        let download_sessions = Arc::new(DownloadSessionRegistry::new(config.clone(), registry.clone(), streams.clone()));
        let policies = Arc::new(PolicyRegistry::new(stores.session, audit.clone()));
        let monitor_runner = Arc::new(MonitorRunner::new(stores.monitor.clone()));
        let service_status_scheduler = Arc::new(ServiceStatusScheduler::new(
            stores.monitor,
            stores.telemetry.clone(),
            registry.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        let telemetry = Arc::new(TelemetryService::new(stores.telemetry, registry.clone()));
        let process_alerts = Arc::new(ProcessAlertEvaluator::new(config.clone(), registry.clone(), notifier));
        let memory_pressure = Arc::new(MemoryPressureMonitor::new(
            config.clone(),
            terminal_sessions.clone(),
            ephemeral_sessions.clone(),
            streams.clone(),
        ));

        Self {
            config,
            audit,
            registry,
            dispatcher,
            streams,
            terminal_sessions,
            ephemeral_sessions,
            download_sessions,
            policies,
            monitor_runner,
            service_status_scheduler,
            telemetry,
            process_alerts,
            memory_pressure,
            settings: stores.settings,
        }
    }
}
