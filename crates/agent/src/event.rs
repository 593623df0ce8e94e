// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The alert event model shared by watchers, queue, and transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which kind of tripwire produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripwireType {
    #[serde(alias = "file")]
    File,
    #[serde(alias = "network")]
    Network,
    #[serde(alias = "process")]
    Process,
}

impl TripwireType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "FILE",
            Self::Network => "NETWORK",
            Self::Process => "PROCESS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FILE" => Some(Self::File),
            "NETWORK" => Some(Self::Network),
            "PROCESS" => Some(Self::Process),
            _ => None,
        }
    }
}

/// Operator-assigned severity of a rule and the alerts it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warn")]
    Warn,
    #[serde(alias = "critical")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A single detected tripwire event.
///
/// Watchers emit events with nil `alert_id` and `host_id`; the orchestrator
/// assigns `alert_id` when the event enters the delivery pipeline (so queued
/// records keep their id across redelivery) and the transport stamps
/// `host_id` from registration. `received_at_us` stays 0 until the server
/// accepts the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: Uuid,
    pub host_id: Uuid,
    pub timestamp_us: i64,
    #[serde(default)]
    pub received_at_us: i64,
    pub tripwire_type: TripwireType,
    pub rule_name: String,
    pub severity: Severity,
    /// Opaque JSON document, carried as raw text end-to-end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_detail: Option<String>,
}

impl AlertEvent {
    /// Build a watcher-emitted event: ids nil, timestamp now, detail attached.
    pub fn observed(
        tripwire_type: TripwireType,
        rule_name: &str,
        severity: Severity,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            alert_id: Uuid::nil(),
            host_id: Uuid::nil(),
            timestamp_us: now_us(),
            received_at_us: 0,
            tripwire_type,
            rule_name: rule_name.to_owned(),
            severity,
            event_detail: Some(detail.to_string()),
        }
    }
}

/// Current wall clock in microseconds since the Unix epoch.
pub fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
