//! HTTP CONNECT tunnels.
//!
//! Handles `CONNECT host:port HTTP/1.1` by opening a TCP connection to the
//! destination (or to the backend named by a `tunnel://` destination
//! override), answering `200 Connection Established` and relaying bytes in
//! both directions. TLS is never terminated here.
//!
//! Also holds the client side of the CONNECT handshake used to chain an
//! outbound connection through an upstream proxy.

use crate::audit::{self, ProxyMode};
use crate::dns::{self, DnsOverrideStore, Resolve};
use crate::error::{ConnectError, ProxyError, Result};
use crate::stream::TunnelIo;
use crate::targets::{DestinationOverrides, TargetScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on an upstream proxy's CONNECT response head.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Collaborators a CONNECT request needs.
pub struct ConnectCtx<'a> {
    pub targets: &'a DestinationOverrides,
    pub dns: &'a dyn DnsOverrideStore,
    pub connect_timeout: Duration,
}

/// Handle an HTTP CONNECT request.
///
/// `first_line` is the already-read CONNECT line. `client` is positioned
/// just past the request head.
pub async fn handle_connect<C: TunnelIo>(
    first_line: &str,
    client: &mut C,
    ctx: &ConnectCtx<'_>,
) -> Result<()> {
    let (host, port) = parse_connect_target(first_line)?;
    debug!("CONNECT request to {}:{}", host, port);

    let target = ctx
        .targets
        .resolve(&host, "/")
        .and_then(|t| match t.endpoint() {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                debug!("Ignoring destination override for {}: {}", host, e);
                None
            }
        });

    let (mode, upstream) = match target {
        Some(endpoint) if endpoint.scheme == TargetScheme::Tunnel => {
            let backend = endpoint.authority();
            audit::log_outbound(ProxyMode::Backend, &format!("CONNECT {}:{}", host, port), None, &[]);
            let result = async {
                let mut stream =
                    dial(&endpoint.host, endpoint.port, None, ctx.connect_timeout).await?;
                open_tunnel(&mut stream, &backend, &host, port).await?;
                Ok::<_, ConnectError>(stream)
            }
            .await;
            (ProxyMode::Backend, result)
        }
        Some(endpoint) => {
            audit::log_outbound(
                ProxyMode::Connect,
                &format!("CONNECT {} (override of {}:{})", endpoint.authority(), host, port),
                None,
                &[],
            );
            (
                ProxyMode::Connect,
                dial(&endpoint.host, endpoint.port, None, ctx.connect_timeout).await,
            )
        }
        None => {
            audit::log_outbound(ProxyMode::Connect, &format!("CONNECT {}:{}", host, port), None, &[]);
            let lookup = ctx.dns.lookup(&host);
            (
                ProxyMode::Connect,
                dial(&host, port, lookup.as_ref(), ctx.connect_timeout).await,
            )
        }
    };

    let mut upstream = match upstream {
        Ok(stream) => stream,
        Err(e) => {
            let status = match &e {
                ConnectError::UpstreamProxy { status, .. } => *status,
                ConnectError::Timeout { .. } => 504,
                _ => 502,
            };
            send_response(client, status, "Tunnel Failed").await?;
            return Err(e.into());
        }
    };

    send_response(client, 200, "Connection Established").await?;

    if let Err(e) = client.tune_for_tunnel() {
        debug!("Could not tune client socket: {}", e);
    }
    if let Err(e) = upstream.tune_for_tunnel() {
        debug!("Could not tune upstream socket: {}", e);
    }

    let destination = format!("{}:{}", host, port);
    match tokio::io::copy_bidirectional(client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            audit::log_tunnel_closed(mode, &destination, to_upstream, to_client);
            Ok(())
        }
        Err(e) => Err(ProxyError::Tunnel {
            host: destination,
            source: e,
        }),
    }
}

/// Resolve `host` (through `lookup` when given) and connect with a timeout.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    lookup: Option<&Arc<dyn Resolve>>,
    timeout: Duration,
) -> std::result::Result<TcpStream, ConnectError> {
    let addrs = dns::resolve(lookup, host, port)
        .await
        .map_err(|e| ConnectError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    connect_to_resolved(&addrs, host, timeout).await
}

/// Connect to one of the pre-resolved socket addresses with timeout.
///
/// Tries each address in order until one succeeds.
async fn connect_to_resolved(
    addrs: &[SocketAddr],
    host: &str,
    timeout: Duration,
) -> std::result::Result<TcpStream, ConnectError> {
    let mut last_err = None;
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(ConnectError::Connect {
                    host: host.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                debug!("Connect to {} timed out", addr);
                last_err = Some(ConnectError::Timeout {
                    host: host.to_string(),
                });
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ConnectError::Resolve {
        host: host.to_string(),
        reason: "no addresses to connect to".to_string(),
    }))
}

/// Ask the proxy at the other end of `stream` to open a tunnel to
/// `host:port` and wait for its `200`.
///
/// The response head is consumed exactly; no tunnelled byte is read.
pub async fn open_tunnel<S>(
    stream: &mut S,
    proxy: &str,
    host: &str,
    port: u16,
) -> std::result::Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        authority, authority
    );
    let io_err = |e: std::io::Error| ConnectError::Connect {
        host: proxy.to_string(),
        reason: e.to_string(),
    };

    stream.write_all(request.as_bytes()).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)?;

    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(ConnectError::Connect {
                host: proxy.to_string(),
                reason: "CONNECT response head too large".to_string(),
            });
        }
        let n = stream.read(&mut byte).await.map_err(io_err)?;
        if n == 0 {
            return Err(ConnectError::Connect {
                host: proxy.to_string(),
                reason: "connection closed during CONNECT".to_string(),
            });
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = parse_status_code(status_line).map_err(|e| ConnectError::Connect {
        host: proxy.to_string(),
        reason: e.to_string(),
    })?;
    if status != 200 {
        return Err(ConnectError::UpstreamProxy {
            proxy: proxy.to_string(),
            host: authority,
            status,
        });
    }
    debug!("Upstream proxy {} opened tunnel to {}", proxy, authority);
    Ok(())
}

/// Parse the target host and port from a CONNECT request line.
///
/// Expected format: "CONNECT host:port HTTP/1.1"
pub fn parse_connect_target(line: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 || !parts[0].eq_ignore_ascii_case("CONNECT") {
        return Err(ProxyError::HttpParse(format!(
            "malformed CONNECT line: {}",
            line
        )));
    }
    // No port specified: default to 443 for CONNECT
    split_authority(parts[1], 443)
}

/// Split `host[:port]` (IPv6 literals in brackets) into host and port.
pub fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let invalid = || ProxyError::HttpParse(format!("invalid authority: {}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(p) => match p.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return Err(invalid()),
        },
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Parse HTTP status code from a response line.
pub(crate) fn parse_status_code(line: &str) -> Result<u16> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return Err(ProxyError::HttpParse(format!(
            "malformed HTTP response: {}",
            line
        )));
    }
    parts[1]
        .parse::<u16>()
        .map_err(|_| ProxyError::HttpParse(format!("invalid status code in response: {}", line)))
}

/// Send a bodiless HTTP response line to the client.
async fn send_response<C: TunnelIo>(client: &mut C, status: u16, reason: &str) -> Result<()> {
    let response = format!("HTTP/1.1 {} {}\r\n\r\n", status, reason);
    client.write_all(response.as_bytes()).await?;
    client.flush().await?;
    Ok(())
}
