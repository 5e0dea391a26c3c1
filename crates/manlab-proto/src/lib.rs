//! Wire types and error taxonomy shared across the ManLab hub.
//!
//! These are the message shapes exchanged over the agent and dashboard
//! websocket transports (see `manlab-hub`), plus the data-model types the
//! rest of the core crates (registry, dispatcher, streaming, sessions,
//! scheduler, telemetry) operate on.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub type NodeId = Uuid;
pub type CommandId = Uuid;
pub type StreamId = Uuid;
pub type SessionId = Uuid;

// ─── Error taxonomy ───────────────────────────────────────────────────────────

/// The hub-wide error taxonomy. Library crates return this; the hub
/// binary is the only place that converts it into a transport response
/// or an audited failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ManlabError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ManlabResult<T> = Result<T, ManlabError>;

// ─── Node ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// What an agent says it can do. Feature checks are default-deny: a
/// feature absent from the map is treated as disabled, never as "unknown
/// and therefore allowed".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesDocument {
    pub tools: BTreeSet<String>,
    pub features: BTreeMap<String, bool>,
}

impl CapabilitiesDocument {
    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }

    pub fn feature_enabled(&self, feature: &str) -> bool {
        self.features.get(feature).copied().unwrap_or(false)
    }
}

/// A registered agent machine.
///
/// Created on first successful registration; status mutates on
/// connect/disconnect/heartbeat/timeout; never destroyed implicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub ip: Option<String>,
    pub os: String,
    pub agent_version: String,
    pub last_seen: DateTime<Utc>,
    pub status: NodeStatus,
    pub capabilities: CapabilitiesDocument,
    pub primary_interface: Option<String>,
    pub mac: Option<String>,
}

/// Per-node heartbeat health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffStatus {
    pub node_id: NodeId,
    pub consecutive_failures: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: NodeStatus,
}

// ─── Command taxonomy ────────────────────────────────────────────────────────

/// The closed enum of command types the dispatcher understands (spec
/// §4.2). Unknown discriminants fail fast at the deserialization boundary
/// rather than being accepted and silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    DockerList,
    DockerStart,
    DockerStop,
    DockerRestart,
    SystemUpdate,
    SystemShutdown,
    SystemRestart,
    AgentShutdown,
    AgentEnableTask,
    AgentDisableTask,
    AgentUninstall,
    Shell,
    ServiceStatus,
    ServiceRestart,
    SmartScan,
    ScriptRun,
    LogRead,
    LogTail,
    TerminalOpen,
    TerminalClose,
    TerminalInput,
    FileList,
    FileRead,
    FileZip,
    FileStream,
    Cancel,
    ConfigUpdate,
}

impl CommandType {
    /// The string discriminant sent over the wire, e.g. `"docker.list"`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::DockerList => "docker.list",
            Self::DockerStart => "docker.start",
            Self::DockerStop => "docker.stop",
            Self::DockerRestart => "docker.restart",
            Self::SystemUpdate => "system.update",
            Self::SystemShutdown => "system.shutdown",
            Self::SystemRestart => "system.restart",
            Self::AgentShutdown => "agent.shutdown",
            Self::AgentEnableTask => "agent.enable_task",
            Self::AgentDisableTask => "agent.disable_task",
            Self::AgentUninstall => "agent.uninstall",
            Self::Shell => "shell.exec",
            Self::ServiceStatus => "service.status",
            Self::ServiceRestart => "service.restart",
            Self::SmartScan => "smart.scan",
            Self::ScriptRun => "script.run",
            Self::LogRead => "log.read",
            Self::LogTail => "log.tail",
            Self::TerminalOpen => "terminal.open",
            Self::TerminalClose => "terminal.close",
            Self::TerminalInput => "terminal.input",
            Self::FileList => "file.list",
            Self::FileRead => "file.read",
            Self::FileZip => "file.zip",
            Self::FileStream => "file.stream",
            Self::Cancel => "command.cancel",
            Self::ConfigUpdate => "config.update",
        }
    }

    /// Parse a wire discriminant. `None` on anything unrecognized — the
    /// caller maps that to `ManlabError::BadRequest("UnsupportedCommand")`.
    pub fn parse(wire_name: &str) -> Option<Self> {
        Some(match wire_name {
            "docker.list" => Self::DockerList,
            "docker.start" => Self::DockerStart,
            "docker.stop" => Self::DockerStop,
            "docker.restart" => Self::DockerRestart,
            "system.update" => Self::SystemUpdate,
            "system.shutdown" => Self::SystemShutdown,
            "system.restart" => Self::SystemRestart,
            "agent.shutdown" => Self::AgentShutdown,
            "agent.enable_task" => Self::AgentEnableTask,
            "agent.disable_task" => Self::AgentDisableTask,
            "agent.uninstall" => Self::AgentUninstall,
            "shell.exec" => Self::Shell,
            "service.status" => Self::ServiceStatus,
            "service.restart" => Self::ServiceRestart,
            "smart.scan" => Self::SmartScan,
            "script.run" => Self::ScriptRun,
            "log.read" => Self::LogRead,
            "log.tail" => Self::LogTail,
            "terminal.open" => Self::TerminalOpen,
            "terminal.close" => Self::TerminalClose,
            "terminal.input" => Self::TerminalInput,
            "file.list" => Self::FileList,
            "file.read" => Self::FileRead,
            "file.zip" => Self::FileZip,
            "file.stream" => Self::FileStream,
            "command.cancel" => Self::Cancel,
            "config.update" => Self::ConfigUpdate,
            _ => return None,
        })
    }
}

/// Command lifecycle: monotone
/// `Queued -> Sent -> InProgress -> (Success|Failed|Cancelled)`; terminal
/// states never mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Sent,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition under the command
    /// state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        use CommandStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Queued, Sent)
                | (Queued, Cancelled)
                | (Sent, InProgress)
                | (Sent, Success)
                | (Sent, Failed)
                | (Sent, Cancelled)
                | (InProgress, Success)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

/// A durably-queued command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandQueueItem {
    pub id: CommandId,
    pub node_id: NodeId,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub output_log: String,
    pub output_truncated: bool,
    pub error: Option<String>,
}

// ─── Agent <-> hub transport frames ──────────────────────────────────────────

/// agent -> hub messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentMessage {
    Register {
        hostname: String,
        os: String,
        agent_version: String,
        ip: Option<String>,
        primary_interface: Option<String>,
        mac: Option<String>,
        capabilities: CapabilitiesDocument,
        token: Option<String>,
    },
    Heartbeat {
        telemetry: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    CommandStatus {
        command_id: CommandId,
        status: CommandStatus,
        logs: Option<String>,
        error: Option<String>,
    },
    ServiceStatusSnapshots {
        snapshots: serde_json::Value,
    },
    SmartDriveSnapshots {
        snapshots: serde_json::Value,
    },
    GpuSnapshots {
        snapshots: serde_json::Value,
    },
    UpsSnapshots {
        snapshots: serde_json::Value,
    },
    TerminalOutput {
        session_id: SessionId,
        data: String,
    },
    StreamChunk {
        stream_id: StreamId,
        seq: u64,
        data: Vec<u8>,
    },
    StreamComplete {
        stream_id: StreamId,
    },
    StreamError {
        stream_id: StreamId,
        message: String,
    },
}

/// hub -> agent messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
    Command {
        command_id: CommandId,
        command_type: CommandType,
        payload: serde_json::Value,
    },
    RequestTelemetry,
    RequestPing,
    CancelCommand {
        command_id: CommandId,
    },
}

// ─── Dashboard fan-out ────────────────────────────────────────────────────────

/// Events published into the dashboard broadcast group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DashboardEvent {
    NodeRegistered { node: Node },
    NodeStatusChanged { node_id: NodeId, status: NodeStatus },
    Telemetry { node_id: NodeId, sample: serde_json::Value },
    CommandUpdate { command: CommandQueueItem },
    ProcessAlerts { node_id: NodeId, alerts: serde_json::Value },
    DownloadProgress { session_id: SessionId, bytes_received: u64, total_bytes: Option<u64> },
    DownloadStatusChanged { session_id: SessionId, status: String },
    BackoffStatus { status: BackoffStatus },
    ServerResourceUsage { pressure_pct: f32 },
}

// ─── Validation helpers ───────────────────────────────────────────────────────

/// A hostname must be non-empty, reasonably short, and printable.
pub fn validate_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && hostname
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// TTLs outside `(0, max]` are rejected by every session registry.
pub fn validate_ttl_secs(ttl_secs: i64, max_ttl_secs: i64) -> bool {
    ttl_secs > 0 && ttl_secs <= max_ttl_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_status_monotone_transitions() {
        assert!(CommandStatus::Queued.can_transition_to(CommandStatus::Sent));
        assert!(CommandStatus::Sent.can_transition_to(CommandStatus::InProgress));
        assert!(CommandStatus::InProgress.can_transition_to(CommandStatus::Success));
        assert!(!CommandStatus::Queued.can_transition_to(CommandStatus::InProgress));
        assert!(!CommandStatus::Success.can_transition_to(CommandStatus::Failed));
        assert!(!CommandStatus::Cancelled.can_transition_to(CommandStatus::Sent));
    }

    #[test]
    fn command_status_terminal_states() {
        assert!(CommandStatus::Success.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
        assert!(!CommandStatus::Queued.is_terminal());
        assert!(!CommandStatus::Sent.is_terminal());
        assert!(!CommandStatus::InProgress.is_terminal());
    }

    #[test]
    fn command_type_roundtrip() {
        for ct in [
            CommandType::DockerList,
            CommandType::Shell,
            CommandType::FileStream,
            CommandType::ConfigUpdate,
        ] {
            let wire = ct.wire_name();
            assert_eq!(CommandType::parse(wire), Some(ct));
        }
        assert_eq!(CommandType::parse("bogus.command"), None);
    }

    #[test]
    fn capabilities_default_deny() {
        let mut caps = CapabilitiesDocument::default();
        caps.tools.insert("docker".to_string());
        caps.features.insert("terminal".to_string(), true);

        assert!(caps.has_tool("docker"));
        assert!(!caps.has_tool("gpu"));
        assert!(caps.feature_enabled("terminal"));
        assert!(!caps.feature_enabled("never_mentioned"));
    }

    #[test]
    fn ttl_validation_rejects_non_positive() {
        assert!(!validate_ttl_secs(0, 3600));
        assert!(!validate_ttl_secs(-5, 3600));
        assert!(validate_ttl_secs(600, 3600));
        assert!(!validate_ttl_secs(3601, 3600));
    }

    #[test]
    fn hostname_validation() {
        assert!(validate_hostname("node-01.fleet.local"));
        assert!(!validate_hostname(""));
        assert!(!validate_hostname("has a space"));
    }
}
