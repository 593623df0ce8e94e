// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert store: row types, the backend trait, and an in-memory backend.
//!
//! Idempotency contract: redelivering an `alert_id` that is already stored
//! inserts nothing, regardless of its new `received_at`. The Postgres
//! backend enforces this with an anti-join on `alert_id` plus the
//! `(alert_id, received_at)` conflict target; the memory backend keeps a
//! seen-id set.

pub mod postgres;
pub mod writer;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

/// Host status shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Online,
    Offline,
    Degraded,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Degraded => "DEGRADED",
        }
    }
}

/// One registered agent host.
#[derive(Debug, Clone)]
pub struct HostRow {
    pub host_id: Uuid,
    pub hostname: String,
    pub platform: String,
    pub agent_version: String,
    pub ip_address: Option<String>,
    pub last_seen_us: Option<i64>,
    pub status: HostStatus,
}

/// One alert, ready for the partitioned store.
#[derive(Debug, Clone)]
pub struct AlertRow {
    pub alert_id: Uuid,
    pub host_id: Uuid,
    /// Agent-observed event time.
    pub timestamp_us: i64,
    /// Server wall clock at acceptance; the partition key.
    pub received_at_us: i64,
    pub tripwire_type: String,
    pub rule_name: String,
    pub severity: String,
    /// Opaque JSON text, validated at ingest.
    pub event_detail: Option<String>,
}

/// Backend behind the storage writer and registration path.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert a batch in one round trip; already-stored `alert_id`s are
    /// silently skipped. Returns the number of rows actually inserted.
    async fn insert_alerts(&self, rows: &[AlertRow]) -> anyhow::Result<u64>;

    /// Atomic upsert keyed on hostname. On conflict the existing `host_id`
    /// is returned, never the new candidate.
    async fn upsert_host(
        &self,
        hostname: &str,
        platform: &str,
        agent_version: &str,
        ip_address: Option<&str>,
    ) -> anyhow::Result<Uuid>;

    async fn hostname_of(&self, host_id: Uuid) -> anyhow::Result<Option<String>>;

    async fn set_host_status(&self, host_id: Uuid, status: HostStatus) -> anyhow::Result<()>;

    async fn touch_last_seen(&self, host_id: Uuid, at_us: i64) -> anyhow::Result<()>;

    /// Release the underlying pool/handles.
    async fn close(&self);
}

/// In-memory backend for tests and the integration harness.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    /// When set, `insert_alerts` fails; simulates a storage outage.
    pub fail_inserts: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct MemoryInner {
    hosts: HashMap<String, HostRow>,
    alerts: Vec<AlertRow>,
    seen: HashSet<Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored alerts in insertion order.
    pub fn alerts(&self) -> Vec<AlertRow> {
        self.inner.lock().alerts.clone()
    }

    pub fn alert_count(&self) -> usize {
        self.inner.lock().alerts.len()
    }

    pub fn host(&self, hostname: &str) -> Option<HostRow> {
        self.inner.lock().hosts.get(hostname).cloned()
    }

    pub fn host_count(&self) -> usize {
        self.inner.lock().hosts.len()
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alerts(&self, rows: &[AlertRow]) -> anyhow::Result<u64> {
        if self.fail_inserts.load(std::sync::atomic::Ordering::Relaxed) {
            anyhow::bail!("storage outage (simulated)");
        }
        let mut inner = self.inner.lock();
        let mut inserted = 0u64;
        for row in rows {
            if inner.seen.insert(row.alert_id) {
                inner.alerts.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_host(
        &self,
        hostname: &str,
        platform: &str,
        agent_version: &str,
        ip_address: Option<&str>,
    ) -> anyhow::Result<Uuid> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.hosts.get_mut(hostname) {
            existing.platform = platform.to_owned();
            existing.agent_version = agent_version.to_owned();
            existing.ip_address = ip_address.map(str::to_owned);
            existing.status = HostStatus::Online;
            return Ok(existing.host_id);
        }
        let host_id = Uuid::new_v4();
        inner.hosts.insert(
            hostname.to_owned(),
            HostRow {
                host_id,
                hostname: hostname.to_owned(),
                platform: platform.to_owned(),
                agent_version: agent_version.to_owned(),
                ip_address: ip_address.map(str::to_owned),
                last_seen_us: None,
                status: HostStatus::Online,
            },
        );
        Ok(host_id)
    }

    async fn hostname_of(&self, host_id: Uuid) -> anyhow::Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .hosts
            .values()
            .find(|h| h.host_id == host_id)
            .map(|h| h.hostname.clone()))
    }

    async fn set_host_status(&self, host_id: Uuid, status: HostStatus) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(host) = inner.hosts.values_mut().find(|h| h.host_id == host_id) {
            host.status = status;
        }
        Ok(())
    }

    async fn touch_last_seen(&self, host_id: Uuid, at_us: i64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(host) = inner.hosts.values_mut().find(|h| h.host_id == host_id) {
            host.last_seen_us = Some(at_us);
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
