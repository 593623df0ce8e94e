// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Lifecycle counters shared by transport, orchestrator, and health endpoint.
#[derive(Debug)]
pub struct AgentMetrics {
    started_at: Instant,
    /// Events ACKed by the server.
    pub alerts_sent_total: AtomicU64,
    /// Connection losses, including failed dials.
    pub reconnect_total: AtomicU64,
    /// Events dropped because the durable queue rejected them. The only
    /// event-loss path in the agent.
    pub events_dropped_total: AtomicU64,
    /// True while the transport is streaming.
    pub connected: AtomicBool,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            alerts_sent_total: AtomicU64::new(0),
            reconnect_total: AtomicU64::new(0),
            events_dropped_total: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn alerts_sent(&self) -> u64 {
        self.alerts_sent_total.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnect_total.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}
