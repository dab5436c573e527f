//! Audit logging for the interception pipeline.
//!
//! Logs every observable decision with structured fields via `tracing`.
//! Header values are never included; only names and destinations.

use crate::dns::DnsDecision;
use tracing::{info, warn};

/// Proxy mode for audit logging.
#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    /// Request relayed or upgraded through the interception pipeline
    Intercept,
    /// CONNECT tunnel opened directly to the destination
    Connect,
    /// CONNECT tunnel chained through a backend proxy
    Backend,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Intercept => write!(f, "intercept"),
            ProxyMode::Connect => write!(f, "connect"),
            ProxyMode::Backend => write!(f, "backend"),
        }
    }
}

/// Log the fully resolved outbound destination before connecting.
pub fn log_outbound(mode: ProxyMode, url: &str, sni: Option<&str>, header_names: &[&str]) {
    info!(
        target: "sidecar_proxy::audit",
        mode = %mode,
        url = url,
        sni = sni.unwrap_or("-"),
        headers = ?header_names,
        "outbound request"
    );
}

/// Log the DNS override decision for a request.
pub fn log_dns_decision(hostname: &str, sni: Option<&str>, decision: &DnsDecision) {
    match decision {
        DnsDecision::Host(resolver) => info!(
            target: "sidecar_proxy::audit",
            host = hostname,
            resolver = resolver.as_str(),
            decision = "host",
            "dns override"
        ),
        DnsDecision::SniFallback(resolver) => warn!(
            target: "sidecar_proxy::audit",
            host = hostname,
            sni = sni.unwrap_or("-"),
            resolver = resolver.as_str(),
            decision = "sni_fallback",
            "host has no dns entry but uses sni; using catch-all resolver"
        ),
        DnsDecision::System => info!(
            target: "sidecar_proxy::audit",
            host = hostname,
            sni = sni.unwrap_or("-"),
            decision = "system",
            "no dns override configured"
        ),
    }
}

/// Log a switch to the pool variant that skips certificate verification.
pub fn log_verification_override(destination: &str, verify_certificates: bool) {
    info!(
        target: "sidecar_proxy::audit",
        destination = destination,
        verify_certificates = verify_certificates,
        "certificate verification overridden by compatibility store"
    );
}

/// Log an automatic downgrade recorded after a self-signed certificate.
pub fn log_compat_downgrade(destination: &str) {
    warn!(
        target: "sidecar_proxy::audit",
        destination = destination,
        verify_certificates = false,
        "self-signed certificate; verification disabled for destination"
    );
}

/// Log a chain stopped by an interceptor that handled the request itself.
pub fn log_chain_halted(interceptor: &str, url: &str) {
    info!(
        target: "sidecar_proxy::audit",
        interceptor = interceptor,
        url = url,
        "interceptor chain halted"
    );
}

/// Log an interceptor failure that aborted the chain.
pub fn log_chain_failed(interceptor: &str, url: &str, error: &str) {
    warn!(
        target: "sidecar_proxy::audit",
        interceptor = interceptor,
        url = url,
        error = error,
        "interceptor chain failed"
    );
}

/// Log a relayed non-upgrade response.
pub fn log_relayed(url: &str, status: u16) {
    info!(
        target: "sidecar_proxy::audit",
        url = url,
        status = status,
        "response relayed"
    );
}

/// Log a closed tunnel with the bytes copied in each direction.
pub fn log_tunnel_closed(mode: ProxyMode, destination: &str, to_upstream: u64, to_client: u64) {
    info!(
        target: "sidecar_proxy::audit",
        mode = %mode,
        destination = destination,
        to_upstream = to_upstream,
        to_client = to_client,
        "tunnel closed"
    );
}
