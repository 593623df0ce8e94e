// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration problems. Caught only by the binary entry point,
/// which exits 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("rule {rule}: watch path does not exist: {path}")]
    MissingPath { rule: String, path: PathBuf },
    #[error("rule {rule}: invalid CIDR target {target:?}")]
    BadCidr { rule: String, target: String },
    #[error("rule {rule}: invalid glob target {target:?}: {source}")]
    BadGlob {
        rule: String,
        target: String,
        #[source]
        source: globset::Error,
    },
    #[error("rule {rule}: {message}")]
    Rule { rule: String, message: String },
    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
