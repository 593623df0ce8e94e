// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PROCESS tripwires: exec detection via `/proc` PID-set polling.
//!
//! The netlink proc connector needs CAP_NET_ADMIN, which the agent should
//! not demand, so new executions are detected by diffing the PID set every
//! second. Processes shorter-lived than one poll interval are missed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{EventSink, WatcherHandle};
use crate::error::ConfigError;
use crate::event::{AlertEvent, TripwireType};
use crate::rules::CompiledRule;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What we could learn about a freshly-seen process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub argv: Vec<String>,
    pub exe: Option<PathBuf>,
}

impl ProcessInfo {
    fn argv0(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Start the PROCESS watcher over the given rules.
pub fn start(
    rules: Vec<CompiledRule>,
    sink: EventSink,
    cancel: CancellationToken,
) -> Result<WatcherHandle, ConfigError> {
    let task = tokio::spawn(run_loop(rules, sink, cancel.clone()));
    Ok(WatcherHandle::new(TripwireType::Process, cancel, task))
}

async fn run_loop(rules: Vec<CompiledRule>, sink: EventSink, cancel: CancellationToken) {
    let mut previous = current_pids();

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = current_pids();
        let mut fresh: Vec<i32> = current.difference(&previous).copied().collect();
        fresh.sort_unstable();

        for pid in fresh {
            // The process may already be gone; that is not an error.
            let Some(info) = inspect(pid) else { continue };
            let Some(rule) = match_exec(&rules, &info) else { continue };
            let alert = AlertEvent::observed(
                TripwireType::Process,
                &rule.name,
                rule.severity,
                serde_json::json!({
                    "pid": info.pid,
                    "argv": info.argv,
                }),
            );
            if sink.send(alert).await.is_err() {
                warn!("process watcher sink closed, stopping");
                return;
            }
        }

        previous = current;
    }
}

/// First rule whose glob matches argv0 or the resolved executable.
fn match_exec<'a>(rules: &'a [CompiledRule], info: &ProcessInfo) -> Option<&'a CompiledRule> {
    rules.iter().find(|r| r.matches_exec(info.argv0(), info.exe.as_deref()))
}

#[cfg(target_os = "linux")]
fn current_pids() -> HashSet<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return HashSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<i32>().ok()))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn current_pids() -> HashSet<i32> {
    HashSet::new()
}

#[cfg(target_os = "linux")]
fn inspect(pid: i32) -> Option<ProcessInfo> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    let cmdline = std::fs::read(proc_dir.join("cmdline")).ok()?;
    let argv = parse_cmdline(&cmdline);
    let exe = std::fs::read_link(proc_dir.join("exe")).ok();
    Some(ProcessInfo { pid, argv, exe })
}

#[cfg(not(target_os = "linux"))]
fn inspect(_pid: i32) -> Option<ProcessInfo> {
    None
}

/// Split a NUL-delimited `/proc/pid/cmdline` into argv strings.
fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
