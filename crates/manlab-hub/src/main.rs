//! manlab-hub — the ManLab fleet management hub.
//!
//! Accepts agent connections on `/hubs/agent`, dashboard subscribers on
//! `/hubs/dashboard`, and exposes a thin REST façade over the command
//! queue, terminal sessions, and download streams. Background tasks run
//! the heartbeat sweep, the monitor scheduler (in-process probes plus the
//! service-status refresh), and the memory-pressure monitor.

mod error;
mod rest;
mod state;
mod ws_agent;
mod ws_dashboard;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use manlab_config::HubConfig;
use manlab_telemetry::{AlertNotifier, LogNotifier, WebhookNotifier};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use state::{build_stores, AppState};

#[derive(Parser)]
#[command(name = "manlab-hub")]
#[command(about = "ManLab fleet management hub")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub (serve agent/dashboard transports and the REST façade)
    Run {
        #[arg(short, long, default_value = "/etc/manlab/hub.json")]
        config: PathBuf,
    },
    /// Write a sample config file
    InitConfig {
        #[arg(short, long, default_value = "/etc/manlab/hub.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("manlab_hub=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_hub(config).await,
        Commands::InitConfig { output } => init_config(output),
    }
}

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    HubConfig::default().save(&output)?;
    println!("Config written to {}", output.display());
    Ok(())
}

async fn run_hub(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Arc::new(HubConfig::load_or_default_with_env(&config_path));
    info!(bind_addr = %config.bind_addr, "starting manlab-hub");

    let pool = manlab_persist::connect_optional(config.database_url.as_deref()).await?;
    let stores = build_stores(pool);

    let notifier: Arc<dyn AlertNotifier> = match config.labels.get("discord_webhook_url") {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let state = AppState::build(config.clone(), stores, notifier);

    spawn_background_tasks(state.clone());

    let app = Router::new()
        .route("/hubs/agent", get(ws_agent::handler))
        .route("/hubs/dashboard", get(ws_dashboard::handler))
        .route("/commands", post(rest::enqueue_command))
        .route("/commands/:id", get(rest::get_command))
        .route("/sessions/terminal", post(rest::create_terminal_session))
        .route("/downloads/:stream_id", get(rest::download))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Every periodic sweep the hub runs, each on its own loop so a slow pass
/// in one never delays another.
fn spawn_background_tasks(state: AppState) {
    let heartbeat_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat_state.config.heartbeat_interval_secs));
        loop {
            ticker.tick().await;
            match heartbeat_state.registry.nodes_past_deadline().await {
                Ok(overdue) => {
                    for node_id in overdue {
                        if let Err(e) = heartbeat_state.registry.record_heartbeat_miss(node_id).await {
                            error!(%node_id, error = %e, "heartbeat miss bookkeeping failed");
                        }
                    }
                }
                Err(e) => error!(error = %e, "heartbeat deadline sweep failed"),
            }
        }
    });

    let monitor_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if let Err(e) = monitor_state.monitor_runner.tick(chrono::Utc::now()).await {
                error!(error = %e, "monitor probe tick failed");
            }
        }
    });

    let service_status_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(service_status_state.config.service_status_poll_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = service_status_state.service_status_scheduler.tick(chrono::Utc::now()).await {
                error!(error = %e, "service status scheduler tick failed");
            }
        }
    });

    let dispatch_sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if let Err(e) = dispatch_sweep_state.dispatcher.sweep_timed_out().await {
                error!(error = %e, "command timeout sweep failed");
            }
            if let Err(e) = dispatch_sweep_state.dispatcher.sweep_cancel_timeouts().await {
                error!(error = %e, "command cancel-timeout sweep failed");
            }
        }
    });

    let session_sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(session_sweep_state.config.session_sweep_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = session_sweep_state.terminal_sessions.sweep_expired().await {
                error!(error = %e, "terminal session sweep failed");
            }
            session_sweep_state.ephemeral_sessions.sweep_expired();
            session_sweep_state.download_sessions.sweep_expired();
            session_sweep_state.streams.sweep_expired();
            session_sweep_state.process_alerts.sweep_expired_cooldowns(chrono::Utc::now());
        }
    });

    let memory_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            if let Some(pct) = memory_state.memory_pressure.sample_pct() {
                memory_state.registry.publish_server_resource_usage(pct);
            }
            memory_state.memory_pressure.tick(chrono::Utc::now()).await;
        }
    });
}
