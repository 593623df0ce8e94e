// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// TripWire dashboard server: ingest, storage writer, broadcaster, gateway.
#[derive(Debug, Clone, Parser)]
#[command(name = "tripwire-server", version, about)]
pub struct ServerConfig {
    /// mTLS gRPC ingest listen address.
    #[arg(long, env = "TRIPWIRE_INGEST_ADDR", default_value = "0.0.0.0:9443")]
    pub ingest_addr: String,

    /// Subscriber WebSocket + health listen address.
    #[arg(long, env = "TRIPWIRE_SUBSCRIBER_ADDR", default_value = "0.0.0.0:8080")]
    pub subscriber_addr: String,

    /// Server certificate (PEM).
    #[arg(long, env = "TRIPWIRE_TLS_CERT")]
    pub tls_cert: PathBuf,

    /// Server private key (PEM).
    #[arg(long, env = "TRIPWIRE_TLS_KEY")]
    pub tls_key: PathBuf,

    /// Operator CA bundle used to verify agent client certificates (PEM).
    #[arg(long, env = "TRIPWIRE_TLS_CA")]
    pub tls_ca: PathBuf,

    /// Postgres DSN for the alert store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Buffered-writer flush threshold in records.
    #[arg(long, env = "TRIPWIRE_FLUSH_MAX_RECORDS", default_value = "100")]
    pub flush_max_records: usize,

    /// Buffered-writer flush ticker in milliseconds.
    #[arg(long, env = "TRIPWIRE_FLUSH_INTERVAL_MS", default_value = "100")]
    pub flush_interval_ms: u64,

    /// Log format (json or text).
    #[arg(long, env = "TRIPWIRE_LOG_FORMAT", default_value = "json")]
    pub log_format: String,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
