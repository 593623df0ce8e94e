// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use super::ConfigError;

#[test]
fn messages_name_the_offending_rule() {
    let err = ConfigError::MissingPath {
        rule: "etc-watch".to_owned(),
        path: PathBuf::from("/nonexistent"),
    };
    let msg = err.to_string();
    assert!(msg.contains("etc-watch"), "unexpected message: {msg}");
    assert!(msg.contains("/nonexistent"), "unexpected message: {msg}");

    let err = ConfigError::BadCidr {
        rule: "ssh-outbound".to_owned(),
        target: "not-a-cidr".to_owned(),
    };
    assert!(err.to_string().contains("not-a-cidr"));
}
