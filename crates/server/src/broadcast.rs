// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process fan-out to subscriber sessions.
//!
//! Every client gets its own bounded channel. `broadcast` serializes a
//! frame once, snapshots the registry under a short read lock, and
//! try-sends outside it. A full channel drops the frame for that client
//! and bumps its `dropped` counter; a slow subscriber can never stall the
//! pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::SecondsFormat;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::storage::AlertRow;

/// Default per-client outbound channel capacity.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// One registered subscriber's sending side.
struct ClientHandle {
    tx: mpsc::Sender<Arc<str>>,
    dropped: Arc<AtomicU64>,
}

/// A registered subscriber session.
pub struct SubscriberClient {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<str>>,
    dropped: Arc<AtomicU64>,
}

impl SubscriberClient {
    /// Frames dropped for this client due to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out registry.
pub struct Broadcaster {
    clients: RwLock<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped_total: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(CLIENT_CHANNEL_CAPACITY)
    }

    /// Per-client channel capacity override (tests use tiny channels).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber and hand back its receiving side.
    pub fn register(&self) -> SubscriberClient {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.clients.write().insert(id, ClientHandle { tx, dropped: Arc::clone(&dropped) });
        SubscriberClient { id, rx, dropped }
    }

    /// Remove and close a subscriber's channel.
    pub fn unregister(&self, id: u64) {
        self.clients.write().remove(&id);
    }

    /// Serialize once and try-send to every client. Never blocks.
    ///
    /// Returns the number of clients that accepted the frame.
    pub fn broadcast(&self, frame: &AlertFrame<'_>) -> usize {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(err = %e, "frame serialization failed");
                return 0;
            }
        };
        self.broadcast_text(json)
    }

    /// Fan out an already-serialized frame.
    pub fn broadcast_text(&self, json: String) -> usize {
        let payload: Arc<str> = Arc::from(json.as_str());

        // Snapshot the senders so the send loop runs outside the lock.
        let targets: Vec<(mpsc::Sender<Arc<str>>, Arc<AtomicU64>)> = {
            let clients = self.clients.read();
            clients
                .values()
                .map(|c| (c.tx.clone(), Arc::clone(&c.dropped)))
                .collect()
        };

        let mut delivered = 0;
        for (tx, dropped) in targets {
            match tx.try_send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        delivered
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Frames dropped across all clients since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// -- Subscriber wire frame ----------------------------------------------------

/// `{type:"alert", data:{...}}` as pushed to subscriber sessions.
#[derive(Serialize)]
pub struct AlertFrame<'a> {
    pub r#type: &'static str,
    pub data: AlertFrameData<'a>,
}

#[derive(Serialize)]
pub struct AlertFrameData<'a> {
    pub alert_id: Uuid,
    pub host_id: Uuid,
    pub hostname: &'a str,
    /// RFC3339 rendering of the agent-observed event time.
    pub timestamp: String,
    pub tripwire_type: &'a str,
    pub rule_name: &'a str,
    pub severity: &'a str,
    /// Embedded verbatim; validated as JSON at ingest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_detail: Option<&'a serde_json::value::RawValue>,
}

/// Build the subscriber frame for an accepted alert.
pub fn alert_frame<'a>(row: &'a AlertRow, hostname: &'a str) -> AlertFrame<'a> {
    let timestamp = chrono::DateTime::from_timestamp_micros(row.timestamp_us)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    AlertFrame {
        r#type: "alert",
        data: AlertFrameData {
            alert_id: row.alert_id,
            host_id: row.host_id,
            hostname,
            timestamp,
            tripwire_type: &row.tripwire_type,
            rule_name: &row.rule_name,
            severity: &row.severity,
            event_detail: row
                .event_detail
                .as_deref()
                .and_then(|s| serde_json::from_str::<&serde_json::value::RawValue>(s).ok()),
        },
    }
}

#[cfg(test)]
#[path = "broadcast_tests.rs"]
mod tests;
