//! WebSocket handler for real-time download progress

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe to progress updates
    let mut progress_rx = state.library.subscribe_progress();

    info!("WebSocket client connected");

    // Spawn task to forward progress updates to client
    let send_task = tokio::spawn(async move {
        loop {
            let update = match progress_rx.recv().await {
                Ok(update) => update,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client lagged; skipped {} updates", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let msg = match serde_json::to_string(&update) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("Failed to encode progress update: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Progress is one-way; drain the socket until the client leaves
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnected");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cancel the send task when client disconnects
    send_task.abort();
}
