//! Hub configuration.
//!
//! Several tunables that might otherwise be scattered constants are exposed
//! here instead of guessed at: cancel/command timeouts, heartbeat backoff,
//! session TTLs, stream capacity, and the node tie-break policy on
//! duplicate registration are all configuration, not code.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Newest-wins vs. reject-new tie-break policy on duplicate node-id
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTieBreakPolicy {
    NewestWins,
    RejectNew,
}

impl Default for NodeTieBreakPolicy {
    fn default() -> Self {
        Self::NewestWins
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Address the agent/dashboard websocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Postgres connection string. `None` runs persistence in-memory only
    /// (mirrors the pack's `DATABASE_URL`-optional convention for local dev).
    #[serde(default)]
    pub database_url: Option<String>,

    /// Optional bearer token agents must present to register.
    #[serde(default)]
    pub agent_auth_token: Option<String>,

    #[serde(default)]
    pub node_tie_break: NodeTieBreakPolicy,

    // ─── Heartbeat / backoff ──────────────────────────────────────────
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    // ─── Command dispatch ─────────────────────────────────────────────
    #[serde(default = "default_command_deadline_secs")]
    pub command_deadline_secs: i64,
    #[serde(default = "default_cancel_timeout_secs")]
    pub cancel_timeout_secs: i64,
    #[serde(default = "default_output_log_cap_bytes")]
    pub command_output_log_cap_bytes: usize,

    // ─── Streaming ─────────────────────────────────────────────────────
    #[serde(default = "default_stream_channel_capacity")]
    pub stream_channel_capacity: usize,
    #[serde(default = "default_stream_chunk_bytes")]
    pub stream_chunk_bytes: usize,
    #[serde(default = "default_stream_max_age_secs")]
    pub stream_max_age_secs: i64,
    #[serde(default = "default_stream_progress_interval_ms")]
    pub stream_progress_interval_ms: u64,
    #[serde(default = "default_stream_progress_pct_threshold")]
    pub stream_progress_pct_threshold: f32,

    // ─── Session registries ───────────────────────────────────────────
    #[serde(default = "default_session_ttl_secs")]
    pub session_default_ttl_secs: i64,
    #[serde(default = "default_session_max_ttl_secs")]
    pub session_max_ttl_secs: i64,
    #[serde(default = "default_session_sweep_interval_secs")]
    pub session_sweep_interval_secs: u64,

    // ─── Monitor scheduler ─────────────────────────────────────────────
    #[serde(default = "default_service_status_poll_interval_secs")]
    pub service_status_poll_interval_secs: u64,
    #[serde(default = "default_service_status_pending_cooldown_secs")]
    pub service_status_pending_cooldown_secs: i64,
    #[serde(default = "default_service_status_min_snapshot_age_secs")]
    pub service_status_min_snapshot_age_secs: i64,

    // ─── Process alerts ─────────────────────────────────────────────────
    #[serde(default = "default_process_alert_cooldown_secs")]
    pub process_alert_cooldown_secs: i64,
    #[serde(default = "default_process_alert_cooldown_cap")]
    pub process_alert_cooldown_cap: usize,

    // ─── Memory pressure / cleanup ──────────────────────────────────────
    #[serde(default = "default_memory_high_pct")]
    pub memory_pressure_high_pct: f32,
    #[serde(default = "default_memory_critical_pct")]
    pub memory_pressure_critical_pct: f32,
    #[serde(default = "default_memory_cooldown_secs")]
    pub memory_pressure_cooldown_secs: i64,

    /// Arbitrary operator-supplied labels, forwarded to the settings table.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:7070".to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_miss_threshold() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    5
}
fn default_backoff_cap_secs() -> u64 {
    300
}
fn default_command_deadline_secs() -> i64 {
    600
}
fn default_cancel_timeout_secs() -> i64 {
    30
}
fn default_output_log_cap_bytes() -> usize {
    256 * 1024
}
fn default_stream_channel_capacity() -> usize {
    16
}
fn default_stream_chunk_bytes() -> usize {
    1024 * 1024
}
fn default_stream_max_age_secs() -> i64 {
    4 * 60 * 60
}
fn default_stream_progress_interval_ms() -> u64 {
    250
}
fn default_stream_progress_pct_threshold() -> f32 {
    5.0
}
fn default_session_ttl_secs() -> i64 {
    10 * 60
}
fn default_session_max_ttl_secs() -> i64 {
    60 * 60
}
fn default_session_sweep_interval_secs() -> u64 {
    60
}
fn default_service_status_poll_interval_secs() -> u64 {
    30
}
fn default_service_status_pending_cooldown_secs() -> i64 {
    60
}
fn default_service_status_min_snapshot_age_secs() -> i64 {
    120
}
fn default_process_alert_cooldown_secs() -> i64 {
    15 * 60
}
fn default_process_alert_cooldown_cap() -> usize {
    10_000
}
fn default_memory_high_pct() -> f32 {
    85.0
}
fn default_memory_critical_pct() -> f32 {
    95.0
}
fn default_memory_cooldown_secs() -> i64 {
    120
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            agent_auth_token: None,
            node_tie_break: NodeTieBreakPolicy::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            command_deadline_secs: default_command_deadline_secs(),
            cancel_timeout_secs: default_cancel_timeout_secs(),
            command_output_log_cap_bytes: default_output_log_cap_bytes(),
            stream_channel_capacity: default_stream_channel_capacity(),
            stream_chunk_bytes: default_stream_chunk_bytes(),
            stream_max_age_secs: default_stream_max_age_secs(),
            stream_progress_interval_ms: default_stream_progress_interval_ms(),
            stream_progress_pct_threshold: default_stream_progress_pct_threshold(),
            session_default_ttl_secs: default_session_ttl_secs(),
            session_max_ttl_secs: default_session_max_ttl_secs(),
            session_sweep_interval_secs: default_session_sweep_interval_secs(),
            service_status_poll_interval_secs: default_service_status_poll_interval_secs(),
            service_status_pending_cooldown_secs: default_service_status_pending_cooldown_secs(),
            service_status_min_snapshot_age_secs: default_service_status_min_snapshot_age_secs(),
            process_alert_cooldown_secs: default_process_alert_cooldown_secs(),
            process_alert_cooldown_cap: default_process_alert_cooldown_cap(),
            memory_pressure_high_pct: default_memory_high_pct(),
            memory_pressure_critical_pct: default_memory_critical_pct(),
            memory_pressure_cooldown_secs: default_memory_cooldown_secs(),
            labels: HashMap::new(),
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        let data = serde_json::to_string_pretty(self).expect("HubConfig always serializes");
        std::fs::write(path, data).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Load from `path` if it exists, falling back to defaults, then apply
    /// environment overrides for the handful of settings operators tend to
    /// need at deploy time without editing the file.
    pub fn load_or_default_with_env(path: &Path) -> Self {
        let mut config = if path.exists() {
            match Self::load(path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "failed to load hub config, using defaults");
                    Self::default()
                }
            }
        } else {
            debug!(path = %path.display(), "no hub config file, using defaults");
            Self::default()
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Ok(bind) = std::env::var("MANLAB_BIND_ADDR") {
            config.bind_addr = bind;
        }
        if let Ok(token) = std::env::var("MANLAB_AGENT_AUTH_TOKEN") {
            config.agent_auth_token = Some(token);
        }

        config
    }

    pub fn backoff_delay_secs(&self, consecutive_failures: u32) -> u64 {
        let scaled = self
            .backoff_base_secs
            .saturating_mul(1u64 << consecutive_failures.min(32));
        scaled.min(self.backoff_cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hub.json");

        let mut cfg = HubConfig::default();
        cfg.bind_addr = "127.0.0.1:9999".to_string();
        cfg.save(&path).expect("save");

        let loaded = HubConfig::load(&path).expect("load");
        assert_eq!(loaded.bind_addr, "127.0.0.1:9999");
        assert_eq!(loaded.heartbeat_miss_threshold, 3);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        let cfg = HubConfig::load_or_default_with_env(&path);
        assert_eq!(cfg.bind_addr, default_bind_addr());
    }

    #[test]
    fn backoff_delay_is_exponential_and_clamped() {
        let cfg = HubConfig {
            backoff_base_secs: 5,
            backoff_cap_secs: 60,
            ..HubConfig::default()
        };
        assert_eq!(cfg.backoff_delay_secs(0), 5);
        assert_eq!(cfg.backoff_delay_secs(1), 10);
        assert_eq!(cfg.backoff_delay_secs(2), 20);
        assert_eq!(cfg.backoff_delay_secs(4), 60); // 5*16=80, clamped to 60
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"bind_addr": "0.0.0.0:1234"}"#).expect("write");
        let cfg = HubConfig::load(&path).expect("load");
        assert_eq!(cfg.bind_addr, "0.0.0.0:1234");
        assert_eq!(cfg.command_deadline_secs, default_command_deadline_secs());
    }
}
