// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriber gateway: long-lived WebSocket push sessions.
//!
//! Each connection registers with the broadcaster and pumps its per-client
//! channel out as text frames. Inbound frames carry no semantics and are
//! drained and discarded; a strict 64 KiB frame cap guards against memory
//! exhaustion. Any read/write error, a missed write deadline, or a close
//! frame tears the session down and unregisters the client.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::state::ServerState;

/// Maximum accepted inbound frame/message size.
const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Per-frame write deadline; a slower client is disconnected.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Build the subscriber router: `/ws` upgrade plus `/healthz`.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "subscribers": state.broadcaster.client_count(),
        "alerts_received_total": state.alerts_received(),
        "broadcast_dropped_total": state.broadcaster.dropped_total(),
    }))
}

/// `GET /ws` — WebSocket upgrade for a subscriber session.
async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_ws(socket, state))
}

/// Per-connection pump.
async fn handle_ws(socket: WebSocket, state: Arc<ServerState>) {
    let mut client = state.broadcaster.register();
    let client_id = client.id;
    debug!(client_id, "subscriber connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            // Broadcaster -> subscriber
            frame = client.rx.recv() => {
                let Some(frame) = frame else { break };
                let send = ws_tx.send(Message::Text(frame.to_string().into()));
                match tokio::time::timeout(WRITE_DEADLINE, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        debug!(client_id, "write deadline exceeded, disconnecting");
                        break;
                    }
                }
            }

            // Subscriber -> server: drained and discarded.
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id, err = %e, "subscriber read error");
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.unregister(client_id);
    debug!(client_id, dropped = client.dropped(), "subscriber disconnected");
}

/// Serve the subscriber gateway on an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    info!(addr = %listener.local_addr()?, "subscriber gateway listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
