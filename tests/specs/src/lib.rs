// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end pipeline scenarios.
//!
//! Runs the real agent pipeline and the real server in-process: minted CA
//! and leaf certificates, actual mutual-TLS gRPC between them, the memory
//! store behind the storage writer, and live WebSocket subscribers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use tripwire_agent::config::{AgentConfig, RuleConfig, TlsConfig};
use tripwire_agent::event::{AlertEvent, Severity, TripwireType};
use tripwire_agent::run::{self, RunningAgent};
use tripwire_agent::transport::proto::tripwire_client::TripwireClient;
use tripwire_server::config::ServerConfig;
use tripwire_server::storage::{AlertStore, MemoryStore};
use tripwire_server::{start_with_store, RunningServer};

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for rustls users in this process.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A minted operator CA plus server and agent leaf certificates, written
/// out as PEM files in a temp dir.
pub struct TestCerts {
    dir: tempfile::TempDir,
}

impl TestCerts {
    /// Mint a CA, a server cert for `localhost`/`127.0.0.1`, and an agent
    /// client cert whose CN is `agent_cn`.
    pub fn generate(agent_cn: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;

        let ca_key = KeyPair::generate()?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "tripwire test ca");
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let server_key = KeyPair::generate()?;
        let mut server_params =
            CertificateParams::new(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])?;
        server_params.distinguished_name.push(DnType::CommonName, "tripwire-dashboard");
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

        let agent_key = KeyPair::generate()?;
        let mut agent_params = CertificateParams::new(vec!["localhost".to_owned()])?;
        agent_params.distinguished_name.push(DnType::CommonName, agent_cn);
        let agent_cert = agent_params.signed_by(&agent_key, &ca_cert, &ca_key)?;

        let write = |name: &str, contents: String| -> anyhow::Result<()> {
            std::fs::write(dir.path().join(name), contents)?;
            Ok(())
        };
        write("ca.pem", ca_cert.pem())?;
        write("server.pem", server_cert.pem())?;
        write("server.key", server_key.serialize_pem())?;
        write("agent.pem", agent_cert.pem())?;
        write("agent.key", agent_key.serialize_pem())?;

        Ok(Self { dir })
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }
    pub fn server_cert_path(&self) -> PathBuf {
        self.dir.path().join("server.pem")
    }
    pub fn server_key_path(&self) -> PathBuf {
        self.dir.path().join("server.key")
    }
    pub fn agent_cert_path(&self) -> PathBuf {
        self.dir.path().join("agent.pem")
    }
    pub fn agent_key_path(&self) -> PathBuf {
        self.dir.path().join("agent.key")
    }
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Server config for the harness; port 0 unless pinned.
pub fn server_config(certs: &TestCerts, ingest_port: u16) -> ServerConfig {
    ServerConfig {
        ingest_addr: format!("127.0.0.1:{ingest_port}"),
        subscriber_addr: "127.0.0.1:0".to_owned(),
        tls_cert: certs.server_cert_path(),
        tls_key: certs.server_key_path(),
        tls_ca: certs.ca_path(),
        database_url: "unused-in-harness".to_owned(),
        flush_max_records: 100,
        flush_interval_ms: 10,
        log_format: "text".to_owned(),
    }
}

/// Start the server on ephemeral ports with the given store.
pub async fn start_server(
    certs: &TestCerts,
    store: Arc<MemoryStore>,
) -> anyhow::Result<RunningServer> {
    ensure_crypto();
    start_with_store(server_config(certs, 0), store as Arc<dyn AlertStore>).await
}

/// Start the server on a pinned ingest port (scenario: server comes up late).
pub async fn start_server_on(
    certs: &TestCerts,
    store: Arc<MemoryStore>,
    ingest_port: u16,
) -> anyhow::Result<RunningServer> {
    ensure_crypto();
    start_with_store(server_config(certs, ingest_port), store as Arc<dyn AlertStore>).await
}

/// Agent config pointed at `ingest_port`, with fast reconnect backoff.
pub fn agent_config(
    certs: &TestCerts,
    hostname: &str,
    ingest_port: u16,
    queue_dir: &Path,
    rules: Vec<RuleConfig>,
) -> AgentConfig {
    AgentConfig {
        dashboard_addr: format!("https://127.0.0.1:{ingest_port}"),
        tls: TlsConfig {
            ca_cert: certs.ca_path(),
            client_cert: certs.agent_cert_path(),
            client_key: certs.agent_key_path(),
            domain_name: Some("localhost".to_owned()),
        },
        hostname: Some(hostname.to_owned()),
        log_level: "info".to_owned(),
        log_format: "text".to_owned(),
        health_addr: None,
        queue_path: queue_dir.join("queue.jsonl"),
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
        rules,
    }
}

/// Start the agent pipeline for the given config.
pub async fn start_agent(config: AgentConfig) -> anyhow::Result<RunningAgent> {
    ensure_crypto();
    run::start(config).await
}

/// A watcher-shaped event ready for injection into the agent sink.
pub fn observed_event(rule: &str, detail: serde_json::Value) -> AlertEvent {
    AlertEvent::observed(TripwireType::File, rule, Severity::Warn, detail)
}

/// Raw mTLS gRPC client, for driving the wire protocol directly.
pub async fn raw_client(
    certs: &TestCerts,
    ingest_addr: SocketAddr,
) -> anyhow::Result<TripwireClient<Channel>> {
    ensure_crypto();
    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(std::fs::read(certs.ca_path())?))
        .identity(Identity::from_pem(
            std::fs::read(certs.agent_cert_path())?,
            std::fs::read(certs.agent_key_path())?,
        ))
        .domain_name("localhost");
    let channel = Channel::from_shared(format!("https://127.0.0.1:{}", ingest_addr.port()))?
        .tls_config(tls)?
        .connect()
        .await?;
    Ok(TripwireClient::new(channel))
}

/// Poll `pred` until it returns true or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut pred: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !pred() {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
