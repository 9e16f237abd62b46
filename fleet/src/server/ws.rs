//! WebSocket batch feed
//!
//! The first text message selects the feed: `{"server_ids": [...]}` starts a
//! new batch, `{"batch_id": "..."}` follows a running one. Every
//! [`BatchEvent`] is then sent as one JSON text frame until the batch
//! finishes. Errors are sent as `{"type": "error", "message": ...}`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app::state::AppState;
use crate::deploy::BatchFeed;
use crate::errors::FleetError;
use crate::models::progress::{BatchEvent, DeployRequest};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedRequest {
    Deploy(DeployRequest),
    Follow { batch_id: String },
}

/// GET /ws/deploy
pub async fn deploy_feed_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket) {
    debug!("Deploy feed connection established");

    let request = match socket.recv().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<FeedRequest>(&text) {
            Ok(request) => request,
            Err(e) => {
                let _ = send_error(&mut socket, &format!("Invalid feed request: {}", e)).await;
                return;
            }
        },
        Some(Ok(Message::Close(_))) | None => {
            debug!("Deploy feed closed before a request was sent");
            return;
        }
        Some(Ok(_)) => {
            let _ = send_error(&mut socket, "Expected a JSON text message").await;
            return;
        }
        Some(Err(e)) => {
            warn!("Deploy feed receive error: {}", e);
            return;
        }
    };

    let feed = match open_feed(&state, request).await {
        Ok(feed) => feed,
        Err(e) => {
            let _ = send_error(&mut socket, &e.to_string()).await;
            return;
        }
    };

    forward(feed, &mut socket).await;
    let _ = socket.send(Message::Close(None)).await;
    debug!("Deploy feed connection closed");
}

async fn open_feed(state: &AppState, request: FeedRequest) -> Result<BatchFeed, FleetError> {
    match request {
        FeedRequest::Deploy(request) => {
            let handle = state.coordinator.start_batch(request.server_ids).await?;
            info!("Batch {} started from deploy feed", handle.batch_id);
            Ok(handle.feed)
        }
        FeedRequest::Follow { batch_id } => state.coordinator.subscribe(&batch_id).await,
    }
}

/// Send feed events until the batch finishes or the client goes away.
/// Closing the socket does not cancel the batch.
async fn forward(mut feed: BatchFeed, socket: &mut WebSocket) {
    loop {
        let frame = match feed.next().await {
            Ok(Some(event)) => event_frame(&event),
            Ok(None) => return,
            Err(e) => {
                warn!("Deploy feed subscriber lagged: {}", e);
                error_frame(&e.to_string())
            }
        };

        if socket.send(Message::Text(frame.into())).await.is_err() {
            warn!("Failed to send progress update, client disconnected");
            return;
        }
    }
}

fn event_frame(event: &BatchEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| error_frame(&e.to_string()))
}

fn error_frame(message: &str) -> String {
    serde_json::json!({ "type": "error", "message": message }).to_string()
}

async fn send_error(socket: &mut WebSocket, message: &str) -> Result<(), axum::Error> {
    socket.send(Message::Text(error_frame(message).into())).await
}
