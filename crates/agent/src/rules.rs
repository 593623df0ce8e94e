// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Compiled rule matchers.
//!
//! Targets are validated once at startup: FILE targets must be existing
//! paths, NETWORK targets parse as CIDR (a bare IP is a /32 or /128), and
//! PROCESS targets compile as shell globs matched against `argv[0]` and the
//! executable path.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ipnetwork::IpNetwork;

use crate::config::RuleConfig;
use crate::error::ConfigError;
use crate::event::{Severity, TripwireType};

/// A rule with its target compiled into a matcher.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub tripwire_type: TripwireType,
    pub severity: Severity,
    pub target: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    /// FILE: recursive watch root.
    Path { root: PathBuf },
    /// NETWORK: remote-address CIDR.
    Cidr { net: IpNetwork },
    /// PROCESS: shell glob over argv0 / executable path.
    Glob { set: GlobSet },
}

impl CompiledRule {
    /// FILE rules: the watch root this rule covers.
    pub fn watch_root(&self) -> Option<&Path> {
        match &self.matcher {
            Matcher::Path { root } => Some(root),
            _ => None,
        }
    }

    /// FILE rules: whether an observed path falls under this rule's root.
    pub fn matches_path(&self, path: &Path) -> bool {
        match &self.matcher {
            Matcher::Path { root } => path.starts_with(root),
            _ => false,
        }
    }

    /// NETWORK rules: whether a remote address falls in this rule's CIDR.
    pub fn matches_remote(&self, addr: IpAddr) -> bool {
        match &self.matcher {
            Matcher::Cidr { net } => net.contains(addr),
            _ => false,
        }
    }

    /// PROCESS rules: whether argv0 or the resolved executable matches.
    pub fn matches_exec(&self, argv0: &str, exe: Option<&Path>) -> bool {
        match &self.matcher {
            Matcher::Glob { set } => {
                set.is_match(argv0) || exe.map(|p| set.is_match(p)).unwrap_or(false)
            }
            _ => false,
        }
    }
}

/// Compile enabled rules, validating each target. Disabled rules are skipped.
pub fn compile(rules: &[RuleConfig]) -> Result<Vec<CompiledRule>, ConfigError> {
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules.iter().filter(|r| r.enabled) {
        let matcher = match rule.rule_type {
            TripwireType::File => {
                let root = PathBuf::from(&rule.target);
                if !root.exists() {
                    return Err(ConfigError::MissingPath {
                        rule: rule.name.clone(),
                        path: root,
                    });
                }
                Matcher::Path { root }
            }
            TripwireType::Network => {
                let net = parse_cidr(&rule.target).ok_or_else(|| ConfigError::BadCidr {
                    rule: rule.name.clone(),
                    target: rule.target.clone(),
                })?;
                Matcher::Cidr { net }
            }
            TripwireType::Process => {
                let glob = Glob::new(&rule.target).map_err(|source| ConfigError::BadGlob {
                    rule: rule.name.clone(),
                    target: rule.target.clone(),
                    source,
                })?;
                let mut builder = GlobSetBuilder::new();
                builder.add(glob);
                let set = builder.build().map_err(|source| ConfigError::BadGlob {
                    rule: rule.name.clone(),
                    target: rule.target.clone(),
                    source,
                })?;
                Matcher::Glob { set }
            }
        };
        compiled.push(CompiledRule {
            name: rule.name.clone(),
            tripwire_type: rule.rule_type,
            severity: rule.severity,
            target: rule.target.clone(),
            matcher,
        });
    }
    Ok(compiled)
}

/// Parse a CIDR target; a bare address is widened to a host network.
fn parse_cidr(target: &str) -> Option<IpNetwork> {
    if let Ok(net) = target.parse::<IpNetwork>() {
        return Some(net);
    }
    target.parse::<IpAddr>().ok().map(IpNetwork::from)
}

/// Rules of one tripwire type, in config order.
pub fn of_type(rules: &[CompiledRule], ty: TripwireType) -> Vec<CompiledRule> {
    rules.iter().filter(|r| r.tripwire_type == ty).cloned().collect()
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
