// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable on-disk FIFO for alert events.
//!
//! An append-only JSONL log with two record shapes:
//! `{"seq":N,"event":{...}}` persists an event, `{"ack":N}` tombstones it.
//! `enqueue` fsyncs before returning, so an event that returned from
//! `enqueue` survives a crash. A pending index (seq → serialized event) is
//! rebuilt by scanning the log on open; once enough tombstones accumulate the
//! log is compacted by rewriting pending entries to a temp file and renaming
//! it into place.
//!
//! Unparseable lines are skipped with a warning; they never poison the queue.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::event::AlertEvent;

/// Tombstone count that triggers a compaction rewrite.
const COMPACT_THRESHOLD: usize = 1024;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("queue serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("queue is closed")]
    Closed,
}

/// Serialization helper for event records (no event clone).
#[derive(Serialize)]
struct EventRecordRef<'a> {
    seq: u64,
    event: &'a AlertEvent,
}

#[derive(Deserialize)]
struct EventRecord<'a> {
    seq: u64,
    #[serde(borrow)]
    event: &'a serde_json::value::RawValue,
}

#[derive(Serialize, Deserialize)]
struct AckRecord {
    ack: u64,
}

struct Inner {
    file: File,
    /// seq → serialized event text, oldest first.
    pending: BTreeMap<u64, String>,
    next_seq: u64,
    acked_since_compact: usize,
    closed: bool,
}

/// Durable, ordered, crash-safe event queue. One file per agent.
///
/// Concurrent `enqueue` and `dequeue`/`ack` are safe; a single consumer
/// (the transport) is expected on the dequeue side.
pub struct Queue {
    path: PathBuf,
    inner: Mutex<Inner>,
    compact_threshold: usize,
}

impl Queue {
    /// Open or create the queue file and rebuild the pending index.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Self::open_with_threshold(path, COMPACT_THRESHOLD)
    }

    fn open_with_threshold(path: &Path, compact_threshold: usize) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        let (pending, max_seq) = scan(&file, path)?;

        Ok(Self {
            path: path.to_owned(),
            inner: Mutex::new(Inner {
                file,
                pending,
                next_seq: max_seq + 1,
                acked_since_compact: 0,
                closed: false,
            }),
            compact_threshold,
        })
    }

    /// Open with a small compaction threshold (test hook).
    #[cfg(test)]
    pub fn open_compacting_every(path: &Path, threshold: usize) -> Result<Self, QueueError> {
        Self::open_with_threshold(path, threshold)
    }

    /// Persist an event and return its sequence number.
    ///
    /// The record is fsynced before this returns.
    pub fn enqueue(&self, event: &AlertEvent) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let seq = inner.next_seq;
        let mut line = serde_json::to_string(&EventRecordRef { seq, event })?;
        // Keep the event text exactly as written for redelivery fidelity.
        let event_text = serde_json::to_string(event)?;
        line.push('\n');
        inner.file.write_all(line.as_bytes())?;
        inner.file.sync_all()?;

        inner.next_seq = seq + 1;
        inner.pending.insert(seq, event_text);
        Ok(seq)
    }

    /// Return up to `n` oldest undelivered events in insertion order.
    /// Does not remove them.
    pub fn dequeue(&self, n: usize) -> Result<Vec<(u64, AlertEvent)>, QueueError> {
        let inner = self.inner.lock();
        let mut batch = Vec::with_capacity(n.min(inner.pending.len()));
        for (&seq, text) in inner.pending.iter().take(n) {
            let event: AlertEvent = serde_json::from_str(text)?;
            batch.push((seq, event));
        }
        Ok(batch)
    }

    /// Remove the named entries. Unknown sequence numbers are ignored.
    pub fn ack(&self, seqs: &[u64]) -> Result<(), QueueError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let mut wrote = false;
        for &seq in seqs {
            if inner.pending.remove(&seq).is_some() {
                let mut line = serde_json::to_string(&AckRecord { ack: seq })?;
                line.push('\n');
                inner.file.write_all(line.as_bytes())?;
                inner.acked_since_compact += 1;
                wrote = true;
            }
        }
        if wrote {
            inner.file.sync_all()?;
        }

        if inner.acked_since_compact >= self.compact_threshold {
            self.compact(&mut inner)?;
        }
        Ok(())
    }

    /// Pending (unacked) record count.
    pub fn depth(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Flush and release the file. Later operations fail with `Closed`.
    pub fn close(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.file.sync_all()?;
        inner.closed = true;
        Ok(())
    }

    /// Rewrite the log with only pending entries (tmp file + atomic rename).
    fn compact(&self, inner: &mut Inner) -> Result<(), QueueError> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for (&seq, text) in inner.pending.iter() {
                tmp.write_all(b"{\"seq\":")?;
                tmp.write_all(seq.to_string().as_bytes())?;
                tmp.write_all(b",\"event\":")?;
                tmp.write_all(text.as_bytes())?;
                tmp.write_all(b"}\n")?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        inner.file = OpenOptions::new().create(true).read(true).append(true).open(&self.path)?;
        inner.acked_since_compact = 0;
        Ok(())
    }
}

/// Scan the log, returning the pending index and the highest seq seen.
fn scan(file: &File, path: &Path) -> Result<(BTreeMap<u64, String>, u64), QueueError> {
    let mut reader = BufReader::new(file.try_clone()?);
    let mut pending: BTreeMap<u64, String> = BTreeMap::new();
    let mut max_seq = 0u64;
    let mut line = String::new();
    let mut line_no = 0u64;

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %path.display(), line = line_no, "non-UTF-8 queue line, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Ok(record) = serde_json::from_str::<EventRecord>(trimmed) {
            max_seq = max_seq.max(record.seq);
            pending.insert(record.seq, record.event.get().to_owned());
        } else if let Ok(ack) = serde_json::from_str::<AckRecord>(trimmed) {
            max_seq = max_seq.max(ack.ack);
            pending.remove(&ack.ack);
        } else {
            warn!(path = %path.display(), line = line_no, "corrupt queue line, skipping");
        }
    }

    Ok((pending, max_seq))
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
