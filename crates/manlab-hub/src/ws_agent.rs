//! `/hubs/agent` — the agent-facing websocket transport.
//!
//! One task per connected agent: a read loop that decodes `AgentMessage`
//! frames and a write task fed by the channel `NodeRegistry::register`
//! binds to the session. The two only share the node id once registration
//! succeeds; nothing the agent sends before `Register` is accepted.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use manlab_proto::{AgentMessage, NodeId};
use manlab_registry::RegisterRequest;
use manlab_telemetry::{ProcessAlertContext, ProcessAlertThresholds, ProcessSample};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run(socket, state))
}

async fn run(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // The first frame off the wire must be `Register`; everything else is
    // dropped until a node id exists to attribute it to.
    let node_id = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(AgentMessage::Register {
                    hostname,
                    os,
                    agent_version,
                    ip,
                    primary_interface,
                    mac,
                    capabilities,
                    token,
                }) => {
                    let (outbound_tx, outbound_rx) = mpsc::channel(32);
                    let req = RegisterRequest {
                        hostname,
                        os,
                        agent_version,
                        ip,
                        primary_interface,
                        mac,
                        capabilities,
                        token,
                    };
                    match state.registry.register(req, outbound_tx).await {
                        Ok(node_id) => {
                            tokio::spawn(writer_task(outbound_rx, sender));
                            let _ = state.dispatcher.dispatch_ready(node_id).await;
                            break node_id;
                        }
                        Err(e) => {
                            warn!(error = %e, "agent registration rejected");
                            let _ = sender
                                .send(Message::Text(serde_json::json!({"error": e.to_string()}).to_string()))
                                .await;
                            return;
                        }
                    }
                }
                Ok(_) => {
                    debug!("ignoring non-register frame before registration");
                }
                Err(e) => {
                    warn!(error = %e, "malformed agent frame before registration");
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            _ => continue,
        }
    };

    info!(node_id = %node_id, "agent session established");

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let message: AgentMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "malformed agent frame");
                continue;
            }
        };

        if let Err(e) = handle_message(&state, node_id, message).await {
            warn!(node_id = %node_id, error = %e, "error handling agent frame");
        }
    }

    info!(node_id = %node_id, "agent session ended");
    let _ = state.registry.disconnect(node_id).await;
}

async fn handle_message(state: &AppState, node_id: NodeId, message: AgentMessage) -> manlab_proto::ManlabResult<()> {
    match message {
        AgentMessage::Register { .. } => {
            debug!(node_id = %node_id, "ignoring duplicate register on an established session");
        }
        AgentMessage::Heartbeat { telemetry, timestamp } => {
            state.telemetry.ingest(node_id, timestamp, telemetry.clone()).await?;
            state.registry.publish_telemetry(node_id, telemetry.clone());
            evaluate_process_alerts(state, node_id, &telemetry).await;
        }
        AgentMessage::CommandStatus { command_id, status, logs, error } => {
            state
                .dispatcher
                .apply_status_report(command_id, status, logs.as_deref(), error.as_deref())
                .await?;
        }
        AgentMessage::ServiceStatusSnapshots { snapshots } => {
            state.telemetry.record_opaque_snapshot("service_status_snapshots", node_id, Utc::now(), snapshots).await?;
        }
        AgentMessage::SmartDriveSnapshots { snapshots } => {
            state.telemetry.record_opaque_snapshot("smart_drive_snapshots", node_id, Utc::now(), snapshots).await?;
        }
        AgentMessage::GpuSnapshots { snapshots } => {
            state.telemetry.record_opaque_snapshot("gpu_snapshots", node_id, Utc::now(), snapshots).await?;
        }
        AgentMessage::UpsSnapshots { snapshots } => {
            state.telemetry.record_opaque_snapshot("ups_snapshots", node_id, Utc::now(), snapshots).await?;
        }
        AgentMessage::TerminalOutput { session_id, data } => {
            debug!(node_id = %node_id, %session_id, bytes = data.len(), "terminal output received");
        }
        AgentMessage::StreamChunk { stream_id, data, .. } => {
            if let Some(stream) = state.streams.get(stream_id) {
                stream.write_chunk(data).await?;
            }
        }
        AgentMessage::StreamComplete { stream_id } => {
            if let Some(stream) = state.streams.get(stream_id) {
                stream.complete().await?;
            }
            state.streams.close(stream_id);
        }
        AgentMessage::StreamError { stream_id, message } => {
            if let Some(stream) = state.streams.get(stream_id) {
                stream.fail(message).await?;
            }
            state.streams.close(stream_id);
        }
    }
    // CommandStatus transitions can unblock previously-queued commands for
    // this node (e.g. a Cancel freeing the slot); piggyback a dispatch pass.
    let _ = state.dispatcher.dispatch_ready(node_id).await;
    Ok(())
}

/// Heartbeats carry an optional `top_processes` array; when present it
/// feeds the process-alert evaluator. Absent or malformed data is simply
/// skipped — alerting is best-effort, not required for the heartbeat to
/// otherwise succeed.
async fn evaluate_process_alerts(state: &AppState, node_id: NodeId, telemetry: &serde_json::Value) {
    let Some(processes) = telemetry.get("top_processes").and_then(|v| v.as_array()) else {
        return;
    };
    let processes: Vec<ProcessSample> = processes
        .iter()
        .filter_map(|p| serde_json::from_value(p.clone()).ok())
        .collect();
    if processes.is_empty() {
        return;
    }
    let ctx = ProcessAlertContext {
        node_id,
        processes,
        thresholds: ProcessAlertThresholds::default(),
    };
    state.process_alerts.evaluate(ctx, Utc::now()).await;
}

async fn writer_task(
    mut outbound_rx: mpsc::Receiver<manlab_proto::HubMessage>,
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let Ok(text) = serde_json::to_string(&message) else {
            continue;
        };
        if sender.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}
