// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent health endpoint: `GET /healthz`.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::AgentMetrics;
use crate::queue::Queue;

#[derive(Clone)]
pub struct HealthState {
    pub queue: Arc<Queue>,
    pub metrics: Arc<AgentMetrics>,
}

/// Build the health router.
pub fn build_router(state: HealthState) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(state)
}

async fn healthz(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let status = if state.metrics.is_connected() { "connected" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "queue_depth": state.queue.depth(),
        "uptime_s": state.metrics.uptime_s(),
        "alerts_sent_total": state.metrics.alerts_sent(),
        "reconnect_total": state.metrics.reconnects(),
    }))
}

/// Serve the health endpoint until shutdown.
pub async fn serve(
    addr: &str,
    state: HealthState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "health endpoint listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
