// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Buffered, coalesced writes to the alert store.
//!
//! `insert` appends to an in-memory buffer and returns immediately; the
//! buffer flushes when it reaches `max_records` or when the ticker fires,
//! whichever comes first. The flush path swaps the live buffer for an empty
//! one under a short lock and performs the store round trip outside it, so
//! concurrent flushes drain disjoint snapshots. A failed flush re-buffers
//! its records; the writer never drops accepted rows.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AlertRow, AlertStore};

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub max_records: usize,
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { max_records: 100, flush_interval: Duration::from_millis(100) }
    }
}

struct Inner {
    store: Arc<dyn AlertStore>,
    buffer: Mutex<Vec<AlertRow>>,
    wake: Notify,
    closed: AtomicBool,
    max_records: usize,
    /// Rows actually inserted (post-dedup), for observability.
    inserted_total: AtomicU64,
    flush_failures: AtomicU64,
}

/// Handle to the buffered writer. Cheap to clone.
#[derive(Clone)]
pub struct StorageWriter {
    inner: Arc<Inner>,
}

impl StorageWriter {
    /// Create the writer and spawn its flush ticker.
    pub fn spawn(
        store: Arc<dyn AlertStore>,
        config: WriterConfig,
        shutdown: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let writer = Self {
            inner: Arc::new(Inner {
                store,
                buffer: Mutex::new(Vec::new()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                max_records: config.max_records.max(1),
                inserted_total: AtomicU64::new(0),
                flush_failures: AtomicU64::new(0),
            }),
        };

        let ticker = writer.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = ticker.inner.wake.notified() => {}
                }
                if let Err(e) = ticker.flush().await {
                    debug!(err = %e, "flush failed, records stay buffered");
                }
            }
        });

        (writer, task)
    }

    /// Buffer one alert. The alert is "accepted" once this returns.
    pub fn insert(&self, row: AlertRow) -> anyhow::Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            anyhow::bail!("storage writer is closed");
        }
        let len = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(row);
            buffer.len()
        };
        if len >= self.inner.max_records {
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Drain a snapshot of the buffer into the store.
    ///
    /// Safe to call concurrently with itself; each call takes a disjoint
    /// snapshot. On error the snapshot is restored to the front of the
    /// buffer and the error is returned.
    pub async fn flush(&self) -> anyhow::Result<u64> {
        let batch = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *buffer)
        };

        let batch = dedup_by_alert_id(batch);

        match self.inner.store.insert_alerts(&batch).await {
            Ok(inserted) => {
                self.inner.inserted_total.fetch_add(inserted, Ordering::Relaxed);
                Ok(inserted)
            }
            Err(e) => {
                self.inner.flush_failures.fetch_add(1, Ordering::Relaxed);
                warn!(records = batch.len(), err = %e, "alert flush failed, re-buffering");
                let mut buffer = self.inner.buffer.lock();
                let mut restored = batch;
                restored.append(&mut buffer);
                *buffer = restored;
                Err(e)
            }
        }
    }

    /// Stop accepting inserts, final-flush, and close the store.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let result = self.flush().await;
        self.inner.store.close().await;
        result.map(|_| ())
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn inserted_total(&self) -> u64 {
        self.inner.inserted_total.load(Ordering::Relaxed)
    }

    pub fn flush_failures(&self) -> u64 {
        self.inner.flush_failures.load(Ordering::Relaxed)
    }
}

/// Keep the first occurrence of each alert_id within one batch.
fn dedup_by_alert_id(batch: Vec<AlertRow>) -> Vec<AlertRow> {
    let mut seen: HashSet<Uuid> = HashSet::with_capacity(batch.len());
    batch.into_iter().filter(|row| seen.insert(row.alert_id)).collect()
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
