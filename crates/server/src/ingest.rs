// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gRPC ingest: agent registration and the bidirectional alert stream.
//!
//! The transport layer enforces mutual TLS; handlers additionally require
//! the verified leaf certificate's CN as the agent identity. Each inbound
//! `AgentEvent` is validated, buffered into the storage writer (that is the
//! acceptance point), ACKed immediately, and fanned out to subscribers.
//! Validation failure answers `ERROR` on the stream and keeps it open.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::alert_frame;
use crate::identity::peer_common_name;
use crate::state::ServerState;
use crate::storage::{AlertRow, HostStatus};

/// Generated protobuf types for the `tripwire.v1` package.
pub mod proto {
    tonic::include_proto!("tripwire.v1");
}

use proto::server_command::CommandType;
use proto::tripwire_server::{Tripwire, TripwireServer};

/// Sent when a stream has been idle this long.
const PING_INTERVAL: Duration = Duration::from_secs(60);
/// Minimum gap between `last_seen` refreshes per stream.
const LAST_SEEN_THROTTLE: Duration = Duration::from_secs(30);
/// Longest accepted `rule_name`, in bytes.
const MAX_RULE_NAME: usize = 256;

const ALLOWED_TYPES: [&str; 3] = ["FILE", "NETWORK", "PROCESS"];
const ALLOWED_SEVERITIES: [&str; 3] = ["INFO", "WARN", "CRITICAL"];

type GrpcStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send + 'static>>;

/// gRPC implementation of the `tripwire.v1.Tripwire` service.
pub struct IngestService {
    state: Arc<ServerState>,
}

impl IngestService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Wrap into the generated tonic service.
    pub fn into_service(self) -> TripwireServer<IngestService> {
        TripwireServer::new(self)
    }
}

#[tonic::async_trait]
impl Tripwire for IngestService {
    async fn register_agent(
        &self,
        request: Request<proto::RegisterAgentRequest>,
    ) -> Result<Response<proto::RegisterAgentResponse>, Status> {
        let cn = peer_common_name(&request)
            .ok_or_else(|| Status::unauthenticated("verified client certificate required"))?;
        let peer_ip = request.remote_addr().map(|addr| addr.ip().to_string());
        let req = request.into_inner();
        if req.hostname.is_empty() {
            return Err(Status::invalid_argument("hostname is required"));
        }
        if cn != req.hostname {
            warn!(cn = %cn, hostname = %req.hostname, "certificate CN differs from registered hostname");
        }

        let host_id = self
            .state
            .store
            .upsert_host(&req.hostname, &req.platform, &req.agent_version, peer_ip.as_deref())
            .await
            .map_err(|e| Status::internal(format!("host upsert failed: {e}")))?;
        self.state.cache_hostname(host_id, &req.hostname);
        info!(cn = %cn, hostname = %req.hostname, host_id = %host_id, "agent registered");

        Ok(Response::new(proto::RegisterAgentResponse {
            host_id: host_id.to_string(),
            server_time_us: now_us(),
        }))
    }

    type StreamAlertsStream = GrpcStream<proto::ServerCommand>;

    async fn stream_alerts(
        &self,
        request: Request<Streaming<proto::AgentEvent>>,
    ) -> Result<Response<Self::StreamAlertsStream>, Status> {
        let cn = peer_common_name(&request)
            .ok_or_else(|| Status::unauthenticated("verified client certificate required"))?;
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(64);

        let state = Arc::clone(&self.state);
        tokio::spawn(handle_stream(state, cn, inbound, tx));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Per-stream handler task.
async fn handle_stream(
    state: Arc<ServerState>,
    cn: String,
    mut inbound: Streaming<proto::AgentEvent>,
    tx: mpsc::Sender<Result<proto::ServerCommand, Status>>,
) {
    info!(cn = %cn, "alert stream opened");
    let mut stream_host: Option<Uuid> = None;
    let mut last_seen_at = Instant::now() - LAST_SEEN_THROTTLE;

    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(PING_INTERVAL) => {
                if tx.send(Ok(ping_command())).await.is_err() {
                    break;
                }
                continue;
            }
            message = inbound.message() => message,
        };

        match message {
            Ok(Some(event)) => {
                let reply =
                    process_event(&state, &cn, event, &mut stream_host, &mut last_seen_at).await;
                if tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(status) => {
                debug!(cn = %cn, status = %status, "alert stream error");
                break;
            }
        }
    }

    if let Some(host_id) = stream_host {
        if let Err(e) = state.store.set_host_status(host_id, HostStatus::Offline).await {
            debug!(err = %e, "offline status update failed");
        }
    }
    info!(cn = %cn, "alert stream closed");
}

/// Validate, buffer, ACK, broadcast.
async fn process_event(
    state: &Arc<ServerState>,
    cn: &str,
    event: proto::AgentEvent,
    stream_host: &mut Option<Uuid>,
    last_seen_at: &mut Instant,
) -> proto::ServerCommand {
    let row = match validate_event(state, &event).await {
        Ok(row) => row,
        Err(message) => {
            warn!(cn = %cn, alert_id = %event.alert_id, reason = %message, "event rejected");
            return error_command(&event.alert_id, &message);
        }
    };

    if stream_host.is_none() {
        *stream_host = Some(row.host_id);
    }
    if last_seen_at.elapsed() >= LAST_SEEN_THROTTLE {
        *last_seen_at = Instant::now();
        if let Err(e) = state.store.touch_last_seen(row.host_id, row.received_at_us).await {
            debug!(err = %e, "last_seen update failed");
        }
    }

    // Buffered acceptance: the writer owns durability from here.
    if let Err(e) = state.writer.insert(row.clone()) {
        warn!(cn = %cn, alert_id = %row.alert_id, err = %e, "storage writer rejected event");
        return error_command(&event.alert_id, "storage unavailable");
    }
    state.alerts_received_total.fetch_add(1, Ordering::Relaxed);

    let hostname = state
        .cached_hostname(row.host_id)
        .unwrap_or_else(|| row.host_id.to_string());
    let frame = alert_frame(&row, &hostname);
    state.broadcaster.broadcast(&frame);

    ack_command(&event.alert_id)
}

/// Field validation; returns the storable row with `received_at` stamped.
async fn validate_event(
    state: &Arc<ServerState>,
    event: &proto::AgentEvent,
) -> Result<AlertRow, String> {
    let alert_id = Uuid::parse_str(&event.alert_id).map_err(|_| "invalid alert_id".to_owned())?;
    if alert_id.is_nil() {
        return Err("alert_id must not be nil".to_owned());
    }
    let host_id = Uuid::parse_str(&event.host_id).map_err(|_| "invalid host_id".to_owned())?;
    if host_id.is_nil() {
        return Err("host_id must not be nil".to_owned());
    }

    // Registration precedes the first stream message, so the cache usually
    // hits; fall back to the store for streams that outlived a cache wipe.
    if state.cached_hostname(host_id).is_none() {
        match state.store.hostname_of(host_id).await {
            Ok(Some(hostname)) => state.cache_hostname(host_id, &hostname),
            Ok(None) => return Err(format!("unknown host_id {host_id}")),
            Err(e) => return Err(format!("host lookup failed: {e}")),
        }
    }

    if !ALLOWED_TYPES.contains(&event.tripwire_type.as_str()) {
        return Err(format!("invalid tripwire_type {:?}", event.tripwire_type));
    }
    if !ALLOWED_SEVERITIES.contains(&event.severity.as_str()) {
        return Err(format!("invalid severity {:?}", event.severity));
    }
    if event.rule_name.is_empty() {
        return Err("rule_name is required".to_owned());
    }
    if event.rule_name.len() > MAX_RULE_NAME {
        return Err("rule_name exceeds 256 bytes".to_owned());
    }
    if event.timestamp_us <= 0 {
        return Err("timestamp_us must be positive".to_owned());
    }
    if let Some(ref detail) = event.event_detail_json {
        if serde_json::from_str::<serde_json::Value>(detail).is_err() {
            return Err("event_detail is not valid JSON".to_owned());
        }
    }

    Ok(AlertRow {
        alert_id,
        host_id,
        timestamp_us: event.timestamp_us,
        received_at_us: now_us(),
        tripwire_type: event.tripwire_type.clone(),
        rule_name: event.rule_name.clone(),
        severity: event.severity.clone(),
        event_detail: event.event_detail_json.clone(),
    })
}

fn ack_command(alert_id: &str) -> proto::ServerCommand {
    proto::ServerCommand {
        r#type: CommandType::Ack as i32,
        payload_json: Some(serde_json::json!({ "alert_id": alert_id }).to_string()),
    }
}

fn error_command(alert_id: &str, message: &str) -> proto::ServerCommand {
    proto::ServerCommand {
        r#type: CommandType::Error as i32,
        payload_json: Some(
            serde_json::json!({ "alert_id": alert_id, "message": message }).to_string(),
        ),
    }
}

fn ping_command() -> proto::ServerCommand {
    proto::ServerCommand { r#type: CommandType::Ping as i32, payload_json: None }
}

fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "ingest_tests.rs"]
mod tests;
