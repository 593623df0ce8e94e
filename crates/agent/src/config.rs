// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::event::{Severity, TripwireType};
use crate::rules;

/// Host-based tripwire agent: watchers, durable queue, mTLS transport.
#[derive(Debug, Parser)]
#[command(name = "tripwire-agent", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a config file and exit.
    Validate {
        /// Path to config.yaml.
        #[arg(long, env = "TRIPWIRE_CONFIG")]
        config: PathBuf,
    },
    /// Start the agent.
    Start {
        /// Path to config.yaml.
        #[arg(long, env = "TRIPWIRE_CONFIG")]
        config: PathBuf,
    },
    /// Print the agent version.
    Version,
}

/// TLS material for the mutual-TLS dial to the dashboard.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Operator CA bundle used to verify the server certificate.
    pub ca_cert: PathBuf,
    /// Client certificate presented to the server; its CN is this agent's identity.
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    /// Override for server-name verification (defaults to the dashboard host).
    #[serde(default)]
    pub domain_name: Option<String>,
}

/// One operator-configured tripwire rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: TripwireType,
    /// Path (FILE), CIDR or bare IP (NETWORK), or shell glob (PROCESS).
    pub target: String,
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "json".to_owned()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

/// The agent's `config.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Dashboard ingest endpoint, e.g. `https://dashboard.internal:9443`.
    pub dashboard_addr: String,
    pub tls: TlsConfig,
    /// Hostname reported at registration; defaults to the kernel hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `json` or `text`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Bind address for `GET /healthz`; omit to disable the endpoint.
    #[serde(default)]
    pub health_addr: Option<String>,
    /// Durable queue file, e.g. `/var/lib/tripwire/queue.jsonl`.
    pub queue_path: PathBuf,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl AgentConfig {
    /// Read and parse `config.yaml`. Does not validate; call [`validate`].
    ///
    /// [`validate`]: AgentConfig::validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Validate the parsed configuration, including rule-target usability.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dashboard_addr.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "dashboard_addr must be an https:// URL (mutual TLS is required), got {:?}",
                self.dashboard_addr
            )));
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid("backoff_base_ms must be positive".to_owned()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_max_ms must be >= backoff_base_ms".to_owned(),
            ));
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "log_format must be json or text, got {other:?}"
                )));
            }
        }
        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(ConfigError::Invalid("rule with empty name".to_owned()));
            }
            if rule.name.len() > 256 {
                return Err(ConfigError::Rule {
                    rule: rule.name.clone(),
                    message: "rule name exceeds 256 bytes".to_owned(),
                });
            }
        }
        // Compiling the matchers performs the per-type target checks.
        rules::compile(&self.rules)?;
        Ok(())
    }

    /// Validate that the TLS files exist (checked separately so `validate`
    /// can run against configs for other hosts).
    pub fn validate_tls_paths(&self) -> Result<(), ConfigError> {
        for (label, path) in [
            ("tls.ca_cert", &self.tls.ca_cert),
            ("tls.client_cert", &self.tls.client_cert),
            ("tls.client_key", &self.tls.client_key),
        ] {
            if !path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "{label} does not exist: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Hostname reported at registration: the config override, or the
    /// kernel hostname, or `unknown-host`.
    pub fn effective_hostname(&self) -> String {
        if let Some(ref h) = self.hostname {
            return h.clone();
        }
        kernel_hostname().unwrap_or_else(|| "unknown-host".to_owned())
    }
}

fn kernel_hostname() -> Option<String> {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(s) = std::fs::read_to_string(path) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
    }
    std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
