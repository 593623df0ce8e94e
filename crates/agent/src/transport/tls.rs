// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-side mutual-TLS configuration for the dashboard dial.

use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::TlsConfig;

/// Build the tonic TLS config: verify the server against the operator CA and
/// present the agent's client certificate.
pub fn client_tls_config(tls: &TlsConfig, dashboard_addr: &str) -> anyhow::Result<ClientTlsConfig> {
    let ca = std::fs::read(&tls.ca_cert)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", tls.ca_cert.display()))?;
    let cert = std::fs::read(&tls.client_cert)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", tls.client_cert.display()))?;
    let key = std::fs::read(&tls.client_key)
        .map_err(|e| anyhow::anyhow!("read {}: {e}", tls.client_key.display()))?;

    let mut config = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key));

    let domain = tls.domain_name.clone().or_else(|| host_of(dashboard_addr));
    if let Some(domain) = domain {
        config = config.domain_name(domain);
    }
    Ok(config)
}

/// Extract the host component of an `https://host[:port][/...]` URL.
fn host_of(url: &str) -> Option<String> {
    let rest = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?']).next()?;
    // Bracketed IPv6 literal.
    if let Some(stripped) = authority.strip_prefix('[') {
        return stripped.split(']').next().filter(|h| !h.is_empty()).map(str::to_owned);
    }
    let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority);
    if host.is_empty() {
        None
    } else {
        Some(host.to_owned())
    }
}

#[cfg(test)]
#[path = "tls_tests.rs"]
mod tests;
