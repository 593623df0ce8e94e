// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-source sensors translating OS events into [`AlertEvent`]s.
//!
//! Each watcher owns its OS event source exclusively and fans in to the
//! shared orchestrator sink. Watchers fail fast on unusable rule targets
//! (`ConfigError`) but never abort on per-event OS errors; those are
//! logged and the watcher continues.

pub mod file;
pub mod network;
pub mod process;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::event::{AlertEvent, TripwireType};
use crate::rules::{self, CompiledRule};

/// Fan-in channel from watchers to the orchestrator.
pub type EventSink = mpsc::Sender<AlertEvent>;

/// A running watcher. Dropping the handle does not stop it; call [`stop`].
///
/// [`stop`]: WatcherHandle::stop
pub struct WatcherHandle {
    kind: TripwireType,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub(crate) fn new(
        kind: TripwireType,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self { kind, cancel, task }
    }

    pub fn kind(&self) -> TripwireType {
        self.kind
    }

    /// Stop the watcher and wait for its task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Start one watcher per tripwire type that has enabled rules.
///
/// Each watcher observes a child of `shutdown`, so cancelling the shared
/// token stops them all; individual handles can still be stopped early.
pub fn start_all(
    compiled: &[CompiledRule],
    sink: EventSink,
    shutdown: &CancellationToken,
) -> Result<Vec<WatcherHandle>, ConfigError> {
    let mut handles = Vec::new();

    let file_rules = rules::of_type(compiled, TripwireType::File);
    if !file_rules.is_empty() {
        handles.push(file::start(file_rules, sink.clone(), shutdown.child_token())?);
    }

    let net_rules = rules::of_type(compiled, TripwireType::Network);
    if !net_rules.is_empty() {
        handles.push(network::start(net_rules, sink.clone(), shutdown.child_token())?);
    }

    let proc_rules = rules::of_type(compiled, TripwireType::Process);
    if !proc_rules.is_empty() {
        handles.push(process::start(proc_rules, sink, shutdown.child_token())?);
    }

    Ok(handles)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
