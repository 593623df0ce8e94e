// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TripWire dashboard server: mTLS gRPC ingest, buffered partitioned
//! storage, and real-time WebSocket fan-out.

pub mod broadcast;
pub mod config;
pub mod gateway;
pub mod identity;
pub mod ingest;
pub mod state;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::ingest::IngestService;
use crate::state::ServerState;
use crate::storage::postgres::PgStore;
use crate::storage::writer::{StorageWriter, WriterConfig};
use crate::storage::AlertStore;

/// Hard limit for shutdown: tasks that have not exited by then are dropped.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// A running server with its bound addresses.
pub struct RunningServer {
    pub ingest_addr: SocketAddr,
    pub subscriber_addr: SocketAddr,
    pub state: Arc<ServerState>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RunningServer {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel everything, final-flush the writer, and wait for tasks.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Err(e) = self.state.writer.close().await {
            warn!(err = %e, "final flush failed; records were re-buffered and are lost at exit");
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        for task in self.tasks.drain(..) {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("task did not exit before the shutdown deadline");
            }
        }
    }
}

/// Read the PEM trio and build the mTLS server config. Client certificates
/// are required and verified against the operator CA.
fn server_tls_config(config: &ServerConfig) -> anyhow::Result<ServerTlsConfig> {
    let cert = std::fs::read(&config.tls_cert)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", config.tls_cert.display()))?;
    let key = std::fs::read(&config.tls_key)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", config.tls_key.display()))?;
    let ca = std::fs::read(&config.tls_ca)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", config.tls_ca.display()))?;

    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca)))
}

/// Start all server components on freshly-bound listeners.
///
/// Shared by `main` (with [`PgStore`]) and the integration harness (with
/// the memory store).
pub async fn start_with_store(
    config: ServerConfig,
    store: Arc<dyn AlertStore>,
) -> anyhow::Result<RunningServer> {
    let shutdown = CancellationToken::new();

    let writer_config = WriterConfig {
        max_records: config.flush_max_records,
        flush_interval: Duration::from_millis(config.flush_interval_ms),
    };
    let (writer, writer_task) =
        StorageWriter::spawn(Arc::clone(&store), writer_config, shutdown.clone());

    let state = Arc::new(ServerState::new(store, writer, shutdown.clone()));
    let mut tasks = vec![writer_task];

    // Ingest: tonic over mTLS.
    let tls = server_tls_config(&config)?;
    let ingest_listener = TcpListener::bind(&config.ingest_addr).await?;
    let ingest_addr = ingest_listener.local_addr()?;
    let ingest = IngestService::new(Arc::clone(&state)).into_service();
    let router = Server::builder().tls_config(tls)?.add_service(ingest);
    let ingest_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = router
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(ingest_listener),
                ingest_shutdown.cancelled_owned(),
            )
            .await
        {
            error!(err = %e, "ingest server exited with error");
        }
    }));
    info!(addr = %ingest_addr, "ingest listening (mTLS)");

    // Subscriber gateway.
    let subscriber_listener = TcpListener::bind(&config.subscriber_addr).await?;
    let subscriber_addr = subscriber_listener.local_addr()?;
    let gateway_state = Arc::clone(&state);
    tasks.push(tokio::spawn(async move {
        if let Err(e) = gateway::serve(subscriber_listener, gateway_state).await {
            error!(err = %e, "subscriber gateway exited with error");
        }
    }));

    Ok(RunningServer { ingest_addr, subscriber_addr, state, shutdown, tasks })
}

/// Connect to Postgres and run until SIGINT/SIGTERM.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    let server = start_with_store(config, store).await?;

    wait_for_signal().await;
    info!("shutdown signal received");
    server.stop().await;
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
