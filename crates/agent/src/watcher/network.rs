// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NETWORK tripwires: kernel connection-table polling.
//!
//! Every second the watcher snapshots ESTABLISHED TCP connections from
//! `/proc/net/tcp` and `/proc/net/tcp6`, diffs against the previous
//! snapshot, and emits an alert for each new connection whose remote
//! address falls inside a rule's CIDR. The initial snapshot is the
//! baseline; pre-existing connections never alert.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventSink, WatcherHandle};
use crate::error::ConfigError;
use crate::event::{AlertEvent, TripwireType};
use crate::rules::CompiledRule;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One established connection, as seen in the kernel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub local_port: u16,
    pub remote: SocketAddr,
}

/// Start the NETWORK watcher over the given rules.
pub fn start(
    rules: Vec<CompiledRule>,
    sink: EventSink,
    cancel: CancellationToken,
) -> Result<WatcherHandle, ConfigError> {
    let task = tokio::spawn(run_loop(rules, sink, cancel.clone()));
    Ok(WatcherHandle::new(TripwireType::Network, cancel, task))
}

async fn run_loop(rules: Vec<CompiledRule>, sink: EventSink, cancel: CancellationToken) {
    let mut previous = match established_connections() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(err = %e, "cannot read connection table, starting empty");
            HashSet::new()
        }
    };

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match established_connections() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(err = %e, "connection table read failed, keeping previous snapshot");
                continue;
            }
        };

        for conn in new_connections(&previous, &current) {
            let Some(rule) = rules.iter().find(|r| r.matches_remote(conn.remote.ip())) else {
                continue;
            };
            let alert = AlertEvent::observed(
                TripwireType::Network,
                &rule.name,
                rule.severity,
                serde_json::json!({
                    "remote_ip": conn.remote.ip().to_string(),
                    "remote_port": conn.remote.port(),
                    "local_port": conn.local_port,
                }),
            );
            if sink.send(alert).await.is_err() {
                warn!("network watcher sink closed, stopping");
                return;
            }
        }

        previous = current;
    }
}

/// Connections present now but not in the previous snapshot, deterministically
/// ordered for stable emission.
fn new_connections(previous: &HashSet<Connection>, current: &HashSet<Connection>) -> Vec<Connection> {
    let mut fresh: Vec<Connection> = current.difference(previous).copied().collect();
    fresh.sort_by_key(|c| (c.remote.ip(), c.remote.port(), c.local_port));
    fresh
}

#[cfg(target_os = "linux")]
fn established_connections() -> std::io::Result<HashSet<Connection>> {
    let mut set = HashSet::new();
    for (path, v6) in [("/proc/net/tcp", false), ("/proc/net/tcp6", true)] {
        match std::fs::read_to_string(path) {
            Ok(contents) => set.extend(parse_proc_net_tcp(&contents, v6)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(set)
}

#[cfg(not(target_os = "linux"))]
fn established_connections() -> std::io::Result<HashSet<Connection>> {
    // No portable connection table; the watcher idles on non-Linux hosts.
    Ok(HashSet::new())
}

/// TCP state code for ESTABLISHED in the proc tables.
const TCP_ESTABLISHED: &str = "01";

/// Parse a `/proc/net/tcp{,6}` table, keeping ESTABLISHED rows.
fn parse_proc_net_tcp(contents: &str, v6: bool) -> Vec<Connection> {
    let mut conns = Vec::new();
    for line in contents.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _sl = fields.next();
        let local = fields.next();
        let remote = fields.next();
        let state = fields.next();
        let (Some(local), Some(remote), Some(state)) = (local, remote, state) else {
            continue;
        };
        if state != TCP_ESTABLISHED {
            continue;
        }
        let (Some(local), Some(remote)) = (parse_hex_addr(local, v6), parse_hex_addr(remote, v6))
        else {
            continue;
        };
        conns.push(Connection { local_port: local.port(), remote });
    }
    conns
}

/// Parse a kernel hex endpoint (`0100007F:0016` or the 32-hex-digit IPv6
/// form). Addresses are stored as little-endian 32-bit words.
fn parse_hex_addr(s: &str, v6: bool) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    let ip = if v6 {
        if addr_hex.len() != 32 {
            return None;
        }
        let mut octets = [0u8; 16];
        for (word_idx, chunk) in addr_hex.as_bytes().chunks(8).enumerate() {
            let word = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
            octets[word_idx * 4..word_idx * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let word = u32::from_str_radix(addr_hex, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(word.to_le_bytes()))
    };

    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
#[path = "network_tests.rs"]
mod tests;
