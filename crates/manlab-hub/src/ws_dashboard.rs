//! `/hubs/dashboard` — the dashboard-facing websocket transport.
//!
//! Every connection just drains its own [`broadcast::Receiver`] and
//! forwards events as JSON text frames. A lagging subscriber gets
//! `RecvError::Lagged`, which the loop logs and resumes from rather than
//! treating as fatal — per the fan-out contract, collapsing to
//! latest-known is acceptable for a slow dashboard.

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run(socket, state))
}

async fn run(mut socket: axum::extract::ws::WebSocket, state: AppState) {
    let mut events = state.registry.subscribe_dashboard();
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "dashboard subscriber lagged, resuming from latest");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("dashboard session ended");
}
