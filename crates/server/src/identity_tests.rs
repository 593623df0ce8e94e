// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use rcgen::{CertificateParams, DnType, KeyPair};

use super::common_name_from_der;

fn self_signed_with_cn(cn: &str) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["localhost".to_owned()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    let cert = params.self_signed(&key).unwrap();
    cert.der().to_vec()
}

#[test]
fn extracts_cn_from_leaf() {
    let der = self_signed_with_cn("web-01");
    assert_eq!(common_name_from_der(&der).as_deref(), Some("web-01"));
}

#[test]
fn cn_with_fleet_style_name() {
    let der = self_signed_with_cn("agent.fleet-7.internal");
    assert_eq!(common_name_from_der(&der).as_deref(), Some("agent.fleet-7.internal"));
}

#[test]
fn garbage_der_yields_none() {
    assert_eq!(common_name_from_der(b"not a certificate"), None);
    assert_eq!(common_name_from_der(&[]), None);
}

#[test]
fn missing_cn_yields_none() {
    let key = KeyPair::generate().unwrap();
    let params = CertificateParams::new(vec!["localhost".to_owned()]).unwrap();
    let cert = params.self_signed(&key).unwrap();
    assert_eq!(common_name_from_der(cert.der().as_ref()), None);
}
