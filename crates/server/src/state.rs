// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared server state handed to ingest and gateway handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::storage::writer::StorageWriter;
use crate::storage::AlertStore;

pub struct ServerState {
    pub store: Arc<dyn AlertStore>,
    pub writer: StorageWriter,
    pub broadcaster: Broadcaster,
    /// Best-effort host_id → hostname cache for the fan-out payload.
    pub hostnames: RwLock<HashMap<Uuid, String>>,
    pub alerts_received_total: AtomicU64,
    pub shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn AlertStore>,
        writer: StorageWriter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            writer,
            broadcaster: Broadcaster::new(),
            hostnames: RwLock::new(HashMap::new()),
            alerts_received_total: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn cache_hostname(&self, host_id: Uuid, hostname: &str) {
        self.hostnames.write().insert(host_id, hostname.to_owned());
    }

    pub fn cached_hostname(&self, host_id: Uuid) -> Option<String> {
        self.hostnames.read().get(&host_id).cloned()
    }

    pub fn alerts_received(&self) -> u64 {
        self.alerts_received_total.load(Ordering::Relaxed)
    }
}
