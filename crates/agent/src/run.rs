// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level agent runner — shared by `main` and integration tests.
//!
//! Wires the pipeline: watchers fan in to one sink, the pump stamps each
//! event's `alert_id`, persists it to the durable queue, and offers it to
//! the transport's live channel. Everything observes one shared
//! cancellation token and drains within [`SHUTDOWN_DEADLINE`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::event::AlertEvent;
use crate::health::{self, HealthState};
use crate::metrics::AgentMetrics;
use crate::queue::Queue;
use crate::rules;
use crate::transport::{Transport, TransportHandle};
use crate::watcher::{self, EventSink, WatcherHandle};

/// Hard limit for shutdown: tasks that have not exited by then are dropped.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Watcher fan-in capacity.
const SINK_CAPACITY: usize = 1024;

/// A running agent pipeline.
pub struct RunningAgent {
    sink: EventSink,
    pub queue: Arc<Queue>,
    pub metrics: Arc<AgentMetrics>,
    shutdown: CancellationToken,
    watchers: Vec<WatcherHandle>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningAgent {
    /// The watcher fan-in sink. Tests inject events here.
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop watchers, cancel all tasks, and close the queue.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for watcher in self.watchers.drain(..) {
            watcher.stop().await;
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        for task in self.tasks.drain(..) {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("task did not exit before the shutdown deadline");
            }
        }
        if let Err(e) = self.queue.close() {
            warn!(err = %e, "queue close failed");
        }
    }
}

/// Start the full pipeline from a validated config.
pub async fn start(config: AgentConfig) -> anyhow::Result<RunningAgent> {
    let compiled = rules::compile(&config.rules)?;
    let queue = Arc::new(Queue::open(&config.queue_path)?);
    let metrics = Arc::new(AgentMetrics::new());
    let shutdown = CancellationToken::new();

    let (transport, transport_handle) =
        Transport::new(&config, Arc::clone(&queue), Arc::clone(&metrics), shutdown.clone())?;

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = transport.run().await {
            error!(err = %e, "transport exited with error");
        }
    }));

    let (sink_tx, sink_rx) = mpsc::channel(SINK_CAPACITY);
    tasks.push(tokio::spawn(pump_events(
        sink_rx,
        Arc::clone(&queue),
        transport_handle,
        Arc::clone(&metrics),
        shutdown.clone(),
    )));

    let watchers = watcher::start_all(&compiled, sink_tx.clone(), &shutdown)?;
    info!(watchers = watchers.len(), rules = compiled.len(), "watchers started");

    if let Some(ref addr) = config.health_addr {
        let state = HealthState { queue: Arc::clone(&queue), metrics: Arc::clone(&metrics) };
        let addr = addr.clone();
        let health_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = health::serve(&addr, state, health_shutdown).await {
                error!(err = %e, "health endpoint exited with error");
            }
        }));
    }

    Ok(RunningAgent { sink: sink_tx, queue, metrics, shutdown, watchers, tasks })
}

/// Fan-in pump: assign `alert_id`, persist, offer to the live stream.
async fn pump_events(
    mut sink_rx: mpsc::Receiver<AlertEvent>,
    queue: Arc<Queue>,
    transport: TransportHandle,
    metrics: Arc<AgentMetrics>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = sink_rx.recv() => event,
        };
        let Some(mut event) = event else { break };

        event.alert_id = Uuid::new_v4();
        match queue.enqueue(&event) {
            Ok(seq) => {
                // Either outcome is fine: ViaQueue means the drain or
                // catch-up pass delivers it.
                let _ = transport.send(seq, event);
            }
            Err(e) => {
                // The only event-loss path in the agent.
                metrics.events_dropped_total.fetch_add(1, Ordering::Relaxed);
                warn!(err = %e, rule = %event.rule_name, "queue rejected event, dropping");
            }
        }
    }
}

/// Run until SIGINT/SIGTERM, then drain and stop.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let agent = start(config).await?;

    wait_for_signal().await;
    info!("shutdown signal received");
    agent.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
