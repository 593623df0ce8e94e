// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconnecting mutual-TLS transport to the dashboard ingest service.
//!
//! One connection at a time, driven by an explicit state machine:
//!
//! `Idle → Connecting → Registering → Draining → Streaming → (Backoff →
//! Connecting)*`
//!
//! After registration the queue is drained oldest-first in batches of
//! [`DRAIN_BATCH`], awaiting a per-event ACK before acking locally. Once the
//! queue is empty, live events are forwarded from a bounded channel while a
//! reader task consumes server ACKs; a periodic catch-up pass re-sends queue
//! entries that missed the live channel. Any error lands in Backoff; a
//! shutdown signal exits cleanly from every state and leaves in-flight
//! events in the queue.

pub mod backoff;
pub mod tls;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::event::AlertEvent;
use crate::metrics::AgentMetrics;
use crate::queue::Queue;
use backoff::Backoff;

/// Generated protobuf types for the `tripwire.v1` package.
pub mod proto {
    tonic::include_proto!("tripwire.v1");
}

use proto::server_command::CommandType;
use proto::tripwire_client::TripwireClient;

/// Oldest events fetched per drain pass.
const DRAIN_BATCH: usize = 50;
/// Live channel capacity; overflow is delivered via the queue instead.
const LIVE_CHANNEL_CAPACITY: usize = 256;
/// Outbound wire channel feeding the gRPC request stream.
const WIRE_CHANNEL_CAPACITY: usize = 64;
/// Hard deadline for the registration RPC.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the streaming phase checks for queue entries to catch up.
const CATCHUP_INTERVAL: Duration = Duration::from_secs(1);

/// Where a producer's event will travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted onto the live channel.
    Live,
    /// Live channel full or disconnected; the durable queue carries it.
    ViaQueue,
}

/// Producer-side handle. Cheap to clone.
#[derive(Clone)]
pub struct TransportHandle {
    live_tx: mpsc::Sender<(u64, AlertEvent)>,
}

impl TransportHandle {
    /// Offer a freshly-enqueued event to the live stream.
    ///
    /// The caller must have already enqueued the event durably; a `ViaQueue`
    /// outcome means the next drain or catch-up pass delivers it.
    pub fn send(&self, seq: u64, event: AlertEvent) -> SendOutcome {
        match self.live_tx.try_send((seq, event)) {
            Ok(()) => SendOutcome::Live,
            Err(_) => SendOutcome::ViaQueue,
        }
    }
}

/// An established connection's moving parts.
struct Conn {
    wire_tx: mpsc::Sender<proto::AgentEvent>,
    inbound: Streaming<proto::ServerCommand>,
    host_id: Uuid,
}

/// The transport state machine states.
enum Phase {
    Idle,
    Connecting,
    Registering { client: TripwireClient<Channel> },
    Draining { conn: Conn },
    Streaming { conn: Conn },
    Backoff,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Registering { .. } => "registering",
            Self::Draining { .. } => "draining",
            Self::Streaming { .. } => "streaming",
            Self::Backoff => "backoff",
        }
    }
}

/// Outcome of the drain phase.
enum DrainOutcome {
    /// Queue empty (or only skipped entries remain); move to streaming.
    Drained(Conn),
    /// Connection lost.
    Lost,
    /// Shutdown observed.
    Shutdown,
}

/// Outcome of the streaming phase.
enum StreamOutcome {
    Lost,
    Shutdown,
}

/// The transport run loop. Owns the live receiver and the single connection.
pub struct Transport {
    endpoint: String,
    tls: tonic::transport::ClientTlsConfig,
    hostname: String,
    backoff_base: Duration,
    backoff_max: Duration,
    queue: Arc<Queue>,
    metrics: Arc<AgentMetrics>,
    live_rx: mpsc::Receiver<(u64, AlertEvent)>,
    shutdown: CancellationToken,
}

impl Transport {
    /// Build the transport and its producer handle from the agent config.
    pub fn new(
        config: &AgentConfig,
        queue: Arc<Queue>,
        metrics: Arc<AgentMetrics>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<(Self, TransportHandle)> {
        let tls = tls::client_tls_config(&config.tls, &config.dashboard_addr)?;
        let (live_tx, live_rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        let transport = Self {
            endpoint: config.dashboard_addr.clone(),
            tls,
            hostname: config.effective_hostname(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            queue,
            metrics,
            live_rx,
            shutdown,
        };
        Ok((transport, TransportHandle { live_tx }))
    }

    /// Drive the state machine until shutdown.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_max);
        let mut phase = Phase::Idle;
        // Entries that drew a validation ERROR on this connection; kept
        // queued but not retried until the next connection.
        let skip: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

        loop {
            if self.shutdown.is_cancelled() {
                info!("transport shutting down");
                return Ok(());
            }

            debug!(state = phase.name(), "transport state");
            phase = match phase {
                Phase::Idle => Phase::Connecting,

                Phase::Connecting => {
                    let dialed = tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        dialed = self.dial() => dialed,
                    };
                    match dialed {
                        Ok(client) => Phase::Registering { client },
                        Err(e) => {
                            warn!(err = %e, "dial failed");
                            self.metrics.reconnect_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            Phase::Backoff
                        }
                    }
                }

                Phase::Registering { mut client } => match self.register(&mut client).await {
                    Ok(conn) => {
                        backoff.reset();
                        skip.lock().clear();
                        // Stale live entries are all in the queue; the drain
                        // pass will deliver them in order.
                        while self.live_rx.try_recv().is_ok() {}
                        Phase::Draining { conn }
                    }
                    Err(e) => {
                        warn!(err = %e, "registration failed");
                        self.metrics.reconnect_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        Phase::Backoff
                    }
                },

                Phase::Draining { conn } => match self.drain(conn, &skip).await {
                    DrainOutcome::Drained(conn) => Phase::Streaming { conn },
                    DrainOutcome::Lost => {
                        self.metrics.reconnect_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        Phase::Backoff
                    }
                    DrainOutcome::Shutdown => return Ok(()),
                },

                Phase::Streaming { conn } => match self.stream(conn, &skip).await {
                    StreamOutcome::Lost => {
                        self.metrics.reconnect_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        Phase::Backoff
                    }
                    StreamOutcome::Shutdown => return Ok(()),
                },

                Phase::Backoff => {
                    let delay = backoff.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => Phase::Connecting,
                    }
                }
            };
        }
    }

    /// Dial the ingest endpoint with mutual TLS.
    async fn dial(&self) -> anyhow::Result<TripwireClient<Channel>> {
        let endpoint = Channel::from_shared(self.endpoint.clone())?
            .tls_config(self.tls.clone())?
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true);
        let channel = endpoint.connect().await?;
        Ok(TripwireClient::new(channel))
    }

    /// Register this agent (10 s hard timeout) and open the alert stream.
    async fn register(&self, client: &mut TripwireClient<Channel>) -> anyhow::Result<Conn> {
        let request = proto::RegisterAgentRequest {
            hostname: self.hostname.clone(),
            platform: std::env::consts::OS.to_owned(),
            agent_version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        let response = tokio::time::timeout(REGISTER_TIMEOUT, client.register_agent(request))
            .await
            .map_err(|_| anyhow::anyhow!("registration timed out"))??
            .into_inner();
        let host_id = Uuid::parse_str(&response.host_id)?;
        info!(host_id = %host_id, hostname = %self.hostname, "registered");

        let (wire_tx, wire_rx) = mpsc::channel(WIRE_CHANNEL_CAPACITY);
        let inbound = client
            .stream_alerts(ReceiverStream::new(wire_rx))
            .await?
            .into_inner();

        Ok(Conn { wire_tx, inbound, host_id })
    }

    /// Empty the queue oldest-first, one ACK at a time.
    async fn drain(&mut self, mut conn: Conn, skip: &Arc<Mutex<HashSet<u64>>>) -> DrainOutcome {
        loop {
            if self.shutdown.is_cancelled() {
                return DrainOutcome::Shutdown;
            }

            let batch = match self.queue.dequeue(DRAIN_BATCH) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(err = %e, "queue read failed during drain");
                    return DrainOutcome::Drained(conn);
                }
            };
            let batch: Vec<_> = {
                let skipped = skip.lock();
                batch.into_iter().filter(|(seq, _)| !skipped.contains(seq)).collect()
            };
            if batch.is_empty() {
                return DrainOutcome::Drained(conn);
            }

            for (seq, mut event) in batch {
                event.host_id = conn.host_id;
                if event.alert_id.is_nil() {
                    event.alert_id = Uuid::new_v4();
                }
                let alert_id = event.alert_id;

                if conn.wire_tx.send(event_to_proto(&event)).await.is_err() {
                    return DrainOutcome::Lost;
                }

                match self.await_command(&mut conn.inbound, alert_id).await {
                    AwaitedCommand::Ack => {
                        if let Err(e) = self.queue.ack(&[seq]) {
                            warn!(err = %e, seq, "local ack failed");
                        }
                        self.metrics
                            .alerts_sent_total
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    AwaitedCommand::Rejected => {
                        // Stays queued; retried on the next connection.
                        skip.lock().insert(seq);
                    }
                    AwaitedCommand::Lost => return DrainOutcome::Lost,
                    AwaitedCommand::Shutdown => return DrainOutcome::Shutdown,
                }
            }
        }
    }

    /// Wait for the server's command about `alert_id`, ignoring pings.
    async fn await_command(
        &self,
        inbound: &mut Streaming<proto::ServerCommand>,
        alert_id: Uuid,
    ) -> AwaitedCommand {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return AwaitedCommand::Shutdown,
                message = inbound.message() => message,
            };
            let command = match message {
                Ok(Some(command)) => command,
                Ok(None) | Err(_) => return AwaitedCommand::Lost,
            };
            match command.r#type() {
                CommandType::Ack if payload_alert_id(&command) == Some(alert_id) => {
                    return AwaitedCommand::Ack;
                }
                CommandType::Error => {
                    warn!(alert_id = %alert_id, payload = command.payload_json.as_deref().unwrap_or(""), "server rejected event");
                    if payload_alert_id(&command) == Some(alert_id) {
                        return AwaitedCommand::Rejected;
                    }
                }
                CommandType::Ping => {}
                _ => {
                    // ACK for an event from a previous connection; the queue
                    // ack is idempotent so nothing to do here.
                }
            }
        }
    }

    /// Forward live events; a reader task consumes ACKs concurrently.
    async fn stream(&mut self, conn: Conn, skip: &Arc<Mutex<HashSet<u64>>>) -> StreamOutcome {
        let Conn { wire_tx, inbound, host_id } = conn;

        let in_flight: Arc<Mutex<HashMap<Uuid, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut reader = tokio::spawn(read_commands(
            inbound,
            Arc::clone(&self.queue),
            Arc::clone(&self.metrics),
            Arc::clone(&in_flight),
            Arc::clone(skip),
        ));

        self.metrics.connected.store(true, std::sync::atomic::Ordering::Relaxed);
        info!(host_id = %host_id, "streaming live events");

        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let live_rx = &mut self.live_rx;
        let mut catchup = tokio::time::interval(CATCHUP_INTERVAL);
        catchup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break StreamOutcome::Shutdown,

                _ = &mut reader => break StreamOutcome::Lost,

                entry = live_rx.recv() => {
                    let Some((seq, mut event)) = entry else {
                        break StreamOutcome::Shutdown;
                    };
                    event.host_id = host_id;
                    in_flight.lock().insert(event.alert_id, seq);
                    if wire_tx.send(event_to_proto(&event)).await.is_err() {
                        break StreamOutcome::Lost;
                    }
                }

                _ = catchup.tick() => {
                    let pending: HashSet<u64> = in_flight.lock().values().copied().collect();
                    if queue.depth() <= pending.len() {
                        continue;
                    }
                    let batch = match queue.dequeue(DRAIN_BATCH) {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(err = %e, "queue read failed during catch-up");
                            continue;
                        }
                    };
                    let mut lost = false;
                    for (seq, mut event) in batch {
                        if pending.contains(&seq) || skip.lock().contains(&seq) {
                            continue;
                        }
                        event.host_id = host_id;
                        if event.alert_id.is_nil() {
                            event.alert_id = Uuid::new_v4();
                        }
                        in_flight.lock().insert(event.alert_id, seq);
                        if wire_tx.send(event_to_proto(&event)).await.is_err() {
                            lost = true;
                            break;
                        }
                    }
                    if lost {
                        break StreamOutcome::Lost;
                    }
                }
            }
        };

        self.metrics.connected.store(false, std::sync::atomic::Ordering::Relaxed);
        reader.abort();
        outcome
    }
}

enum AwaitedCommand {
    Ack,
    Rejected,
    Lost,
    Shutdown,
}

/// Streaming-phase reader: consume server commands until the stream ends.
async fn read_commands(
    mut inbound: Streaming<proto::ServerCommand>,
    queue: Arc<Queue>,
    metrics: Arc<AgentMetrics>,
    in_flight: Arc<Mutex<HashMap<Uuid, u64>>>,
    skip: Arc<Mutex<HashSet<u64>>>,
) {
    loop {
        let command = match inbound.message().await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(e) => {
                debug!(err = %e, "alert stream closed");
                break;
            }
        };
        match command.r#type() {
            CommandType::Ack => {
                if let Some(alert_id) = payload_alert_id(&command) {
                    if let Some(seq) = in_flight.lock().remove(&alert_id) {
                        if let Err(e) = queue.ack(&[seq]) {
                            warn!(err = %e, seq, "local ack failed");
                        }
                    }
                }
                metrics.alerts_sent_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            CommandType::Error => {
                let payload = command.payload_json.as_deref().unwrap_or("");
                warn!(payload, "server rejected event");
                if let Some(alert_id) = payload_alert_id(&command) {
                    // Keep it queued but out of catch-up passes; it is
                    // retried on the next connection.
                    if let Some(seq) = in_flight.lock().remove(&alert_id) {
                        skip.lock().insert(seq);
                    }
                }
            }
            CommandType::Ping => {}
            _ => {}
        }
    }
}

/// Convert a domain [`AlertEvent`] to its wire form.
pub fn event_to_proto(event: &AlertEvent) -> proto::AgentEvent {
    proto::AgentEvent {
        alert_id: event.alert_id.to_string(),
        host_id: event.host_id.to_string(),
        timestamp_us: event.timestamp_us,
        tripwire_type: event.tripwire_type.as_str().to_owned(),
        rule_name: event.rule_name.clone(),
        severity: event.severity.as_str().to_owned(),
        event_detail_json: event.event_detail.clone(),
    }
}

/// Extract the `alert_id` from an ACK/ERROR payload.
fn payload_alert_id(command: &proto::ServerCommand) -> Option<Uuid> {
    let payload = command.payload_json.as_deref()?;
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    Uuid::parse_str(value.get("alert_id")?.as_str()?).ok()
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
