//! Thin REST façade: each route is a direct adapter over the component
//! that actually owns the behavior. Bit-exact route/DTO shape is out of
//! scope — these exist to demonstrate the wiring, not to be a complete API.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use manlab_proto::{CommandId, CommandType, NodeId};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct EnqueueCommandRequest {
    pub node_id: NodeId,
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub async fn enqueue_command(
    State(state): State<AppState>,
    Json(req): Json<EnqueueCommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let command_type = CommandType::parse(&req.command_type)
        .ok_or_else(|| manlab_proto::ManlabError::BadRequest(format!("unsupported command type: {}", req.command_type)))?;
    let command_id = state.dispatcher.enqueue(req.node_id, command_type, req.payload).await?;
    let _ = state.dispatcher.dispatch_ready(req.node_id).await;
    Ok(Json(serde_json::json!({ "command_id": command_id })))
}

pub async fn get_command(State(state): State<AppState>, Path(id): Path<CommandId>) -> Result<impl IntoResponse, ApiError> {
    let command = state.dispatcher.get(id).await?.ok_or_else(|| manlab_proto::ManlabError::NotFound(id.to_string()))?;
    Ok(Json(command))
}

#[derive(Deserialize)]
pub struct CreateTerminalSessionRequest {
    pub node_id: NodeId,
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

pub async fn create_terminal_session(
    State(state): State<AppState>,
    Json(req): Json<CreateTerminalSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.terminal_sessions.open(req.node_id, req.ttl_secs).await?;
    Ok(Json(session))
}

/// Streams a previously-opened download session's chunks as an HTTP
/// chunked response. The stream must already exist — created by a
/// `FileStream` command's agent-side response, not by this route.
pub async fn download(
    State(state): State<AppState>,
    Path(stream_id): Path<manlab_proto::StreamId>,
) -> Result<impl IntoResponse, ApiError> {
    let stream = state
        .streams
        .get(stream_id)
        .ok_or_else(|| manlab_proto::ManlabError::NotFound(format!("stream {stream_id}")))?;

    Ok(Json(serde_json::json!({
        "stream_id": stream_id,
        "bytes_sent": stream.bytes_sent(),
        "total_bytes": stream.total_bytes,
    })))
}
