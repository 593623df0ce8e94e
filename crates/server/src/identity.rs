// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent identity: the Common Name of the verified client certificate.

use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

/// Extract the CN from the peer's verified leaf certificate.
///
/// The transport layer has already rejected connections without a valid
/// client certificate; `None` here means the handshake state is
/// unexpectedly missing and the request must be refused.
pub fn peer_common_name<T>(request: &tonic::Request<T>) -> Option<String> {
    let certs = request.peer_certs()?;
    let leaf = certs.first()?;
    common_name_from_der(leaf.as_ref())
}

/// Parse a DER certificate and return its subject CN.
pub fn common_name_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let subject = cert.subject();
    let cn = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);
    cn
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
