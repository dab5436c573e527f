//! Inbound request heads and the outbound description built from them.
//!
//! The builder parses the request target (absolute form, or origin form plus
//! `Host`), drops proxy hop headers, snapshots the request as the client
//! sent it, and then applies destination overrides.

use crate::connect::split_authority;
use crate::error::{ProxyError, Result};
use crate::pool::PoolHandle;
use crate::request::{Headers, OutboundRequest, Protocol};
use crate::targets::{DestinationOverrides, TargetScheme};
use std::sync::Arc;
use tracing::debug;

/// Hop-by-hop headers addressed to this proxy, never forwarded.
const PROXY_HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

/// A parsed inbound request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Header lines in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl InboundHead {
    /// Parse the request line and the raw header block that follows it.
    pub fn parse(first_line: &str, header_bytes: &[u8]) -> Result<Self> {
        let (method, target, version) = parse_request_line(first_line)?;
        let header_str = std::str::from_utf8(header_bytes)
            .map_err(|_| ProxyError::HttpParse("request headers are not valid UTF-8".to_string()))?;

        let mut headers = Vec::new();
        for line in header_str.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::HttpParse(format!("malformed header line: {}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// First value of `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Parse an HTTP request line into (method, target, version).
pub(crate) fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        )));
    }
    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}

/// Builds [`OutboundRequest`]s for inbound requests.
#[derive(Debug, Clone)]
pub struct OutboundBuilder {
    targets: Arc<DestinationOverrides>,
    pool: Option<PoolHandle>,
}

impl OutboundBuilder {
    pub fn new(targets: Arc<DestinationOverrides>, pool: Option<PoolHandle>) -> Self {
        Self { targets, pool }
    }

    /// Build the outbound description for `head`.
    ///
    /// `tls` tells whether the inbound connection was TLS (decides the
    /// protocol for origin-form targets). `connection_id` identifies the
    /// inbound connection; requests in an NTLM or Negotiate handshake are
    /// bound to it.
    pub fn build(&self, head: &InboundHead, tls: bool, connection_id: u64) -> Result<OutboundRequest> {
        let (protocol, hostname, port, path) = destination(head, tls)?;

        let headers: Headers = head
            .headers
            .iter()
            .filter(|(name, _)| {
                !PROXY_HOP_HEADERS
                    .iter()
                    .any(|hop| name.eq_ignore_ascii_case(hop))
            })
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();

        let mut request = OutboundRequest::new(&head.method, protocol, &hostname, port, &path)?
            .with_headers(headers);
        request.agent = self.pool.clone();
        request.capture_original();

        if is_connection_auth(head.header("authorization")) {
            request.custom_socket_id = Some(connection_id);
        }

        self.apply_destination_override(&mut request)?;
        Ok(request)
    }

    fn apply_destination_override(&self, request: &mut OutboundRequest) -> Result<()> {
        let Some(target) = self.targets.resolve(&request.hostname, &request.path) else {
            return Ok(());
        };
        let endpoint = target.endpoint()?;
        match endpoint.scheme {
            TargetScheme::Tunnel => {
                debug!(
                    "{} chained through backend {} ({})",
                    request.destination(),
                    endpoint.authority(),
                    target.description
                );
                request.upstream_proxy = Some(endpoint.authority());
            }
            TargetScheme::Http | TargetScheme::Https => {
                debug!(
                    "{} redirected to {} ({})",
                    request.destination(),
                    target.proxy_target,
                    target.description
                );
                request.protocol = if endpoint.scheme == TargetScheme::Https {
                    Protocol::Https
                } else {
                    Protocol::Http
                };
                request.hostname = endpoint.host;
                request.port = endpoint.port;
            }
        }
        Ok(())
    }
}

/// Protocol, hostname, port and path of the request target.
fn destination(head: &InboundHead, tls: bool) -> Result<(Protocol, String, u16, String)> {
    if head.target.starts_with('/') {
        let protocol = if tls { Protocol::Https } else { Protocol::Http };
        let host = head.header("host").ok_or_else(|| {
            ProxyError::HttpParse(format!("origin-form request without Host: {}", head.target))
        })?;
        let (hostname, port) = split_authority(host, protocol.default_port())?;
        return Ok((protocol, hostname, port, head.target.clone()));
    }

    let parsed = url::Url::parse(&head.target).map_err(|e| {
        ProxyError::HttpParse(format!("invalid request target '{}': {}", head.target, e))
    })?;
    let protocol: Protocol = parsed.scheme().parse()?;
    let hostname = parsed
        .host_str()
        .ok_or_else(|| ProxyError::HttpParse(format!("missing host in {}", head.target)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = parsed.port().unwrap_or(protocol.default_port());
    let path = match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    };
    Ok((protocol, hostname, port, path))
}

/// Whether an `Authorization` value starts a connection-bound handshake.
fn is_connection_auth(value: Option<&str>) -> bool {
    let Some(value) = value else {
        return false;
    };
    let scheme = value.split_whitespace().next().unwrap_or_default();
    scheme.eq_ignore_ascii_case("NTLM") || scheme.eq_ignore_ascii_case("Negotiate")
}
