// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! FILE tripwires: recursive filesystem watches via `notify`.
//!
//! Bursts on the same `(path, op)` are deduplicated within a 100 ms window
//! so editors that rewrite a file several times per save produce one alert.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventSink, WatcherHandle};
use crate::error::ConfigError;
use crate::event::{AlertEvent, TripwireType};
use crate::rules::CompiledRule;

/// Dedup window for repeated `(path, op)` bursts.
const DEDUP_WINDOW: Duration = Duration::from_millis(100);

/// Filesystem operation reported in `event_detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOp {
    Create,
    Modify,
    Delete,
    Rename,
}

impl FileOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Rename => "rename",
        }
    }
}

/// Map a notify event kind to the wire operation. Access-only events are
/// ignored.
fn map_op(kind: &EventKind) -> Option<FileOp> {
    match kind {
        EventKind::Create(_) => Some(FileOp::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileOp::Rename),
        EventKind::Modify(_) => Some(FileOp::Modify),
        EventKind::Remove(_) => Some(FileOp::Delete),
        _ => None,
    }
}

/// Sliding-window deduplication on `(path, op)`.
struct BurstDedup {
    window: Duration,
    seen: HashMap<(PathBuf, FileOp), Instant>,
}

impl BurstDedup {
    fn new(window: Duration) -> Self {
        Self { window, seen: HashMap::new() }
    }

    /// True if this occurrence should be emitted.
    fn admit(&mut self, path: &Path, op: FileOp, now: Instant) -> bool {
        // Opportunistic prune so the map does not grow unbounded.
        if self.seen.len() > 4096 {
            let window = self.window;
            self.seen.retain(|_, last| now.duration_since(*last) < window);
        }
        let key = (path.to_path_buf(), op);
        match self.seen.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }
}

/// Start the FILE watcher over the given rules.
pub fn start(
    rules: Vec<CompiledRule>,
    sink: EventSink,
    cancel: CancellationToken,
) -> Result<WatcherHandle, ConfigError> {
    let (raw_tx, raw_rx) = mpsc::channel::<notify::Event>(1024);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            // A full channel means we are already behind; the burst dedup
            // makes the loss harmless.
            Ok(event) => {
                let _ = raw_tx.try_send(event);
            }
            Err(e) => debug!(err = %e, "file watcher backend error"),
        }
    })
    .map_err(|e| ConfigError::Invalid(format!("cannot create file watcher: {e}")))?;

    for rule in &rules {
        let Some(root) = rule.watch_root() else { continue };
        watcher.watch(root, RecursiveMode::Recursive).map_err(|e| ConfigError::Rule {
            rule: rule.name.clone(),
            message: format!("cannot watch {}: {e}", root.display()),
        })?;
    }

    let task = tokio::spawn(run_loop(watcher, rules, raw_rx, sink, cancel.clone()));
    Ok(WatcherHandle::new(TripwireType::File, cancel, task))
}

async fn run_loop(
    // Held so the OS watches stay registered for the loop's lifetime.
    _watcher: notify::RecommendedWatcher,
    rules: Vec<CompiledRule>,
    mut raw_rx: mpsc::Receiver<notify::Event>,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let mut dedup = BurstDedup::new(DEDUP_WINDOW);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = raw_rx.recv() => {
                let Some(event) = event else { break };
                let Some(op) = map_op(&event.kind) else { continue };
                for path in &event.paths {
                    let Some(rule) = rules.iter().find(|r| r.matches_path(path)) else {
                        continue;
                    };
                    if !dedup.admit(path, op, Instant::now()) {
                        continue;
                    }
                    let alert = AlertEvent::observed(
                        TripwireType::File,
                        &rule.name,
                        rule.severity,
                        serde_json::json!({
                            "path": path.display().to_string(),
                            "op": op.as_str(),
                        }),
                    );
                    if sink.send(alert).await.is_err() {
                        warn!("file watcher sink closed, stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
