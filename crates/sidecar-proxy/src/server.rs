//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! The server binds to `config.bind_addr:config.bind_port`, accepts TCP
//! connections, reads the request head, and dispatches:
//!
//! CONNECT method -> [`connect`] handler
//! Other methods  -> outbound builder, then the [`TunnelEstablisher`]
//!
//! HTTP/1.1 connections are kept alive across relayed requests, so every
//! request of an NTLM or Negotiate handshake carries the same connection id.
//! Socket bindings of a connection are evicted when it closes.

use crate::compat::MemoryCompatStore;
use crate::config::ProxyConfig;
use crate::connect::{self, ConnectCtx};
use crate::context::CounterSnapshot;
use crate::dns::DnsTable;
use crate::error::{ProxyError, Result};
use crate::inbound::{InboundHead, OutboundBuilder};
use crate::matcher::{default_interceptors, RuleMatcher};
use crate::pool::{ConnectionPool, PoolHandle, TcpPool};
use crate::targets::DestinationOverrides;
use crate::tunnel::{TunnelEstablisher, TunnelOutcome};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle returned when the proxy server starts.
///
/// Contains the assigned port, the shared tables a supervisor may update,
/// and a shutdown channel. Call `shutdown()` to stop the proxy.
pub struct ProxyHandle {
    /// The actual port the proxy is listening on
    pub port: u16,
    targets: Arc<DestinationOverrides>,
    compat: Arc<MemoryCompatStore>,
    state: Arc<ProxyState>,
    /// Send `true` to trigger graceful shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// Signal the proxy to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Destination-override table consulted for every request.
    ///
    /// Backends register their `tunnel://` entries here and remove them by
    /// description when they stop.
    #[must_use]
    pub fn targets(&self) -> &Arc<DestinationOverrides> {
        &self.targets
    }

    /// Certificate compatibility decisions.
    #[must_use]
    pub fn compat(&self) -> &Arc<MemoryCompatStore> {
        &self.compat
    }

    /// Request counters so far.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.state.establisher.counter().snapshot()
    }

    /// `http://addr:port` for clients to use as their proxy.
    #[must_use]
    pub fn proxy_url(&self) -> String {
        format!("http://{}", SocketAddr::new(self.state.config.bind_addr, self.port))
    }
}

/// Shared state for the proxy server.
struct ProxyState {
    config: ProxyConfig,
    builder: OutboundBuilder,
    establisher: TunnelEstablisher,
    targets: Arc<DestinationOverrides>,
    dns: Arc<DnsTable>,
    pool: PoolHandle,
    /// Active connection count for connection limiting.
    active_connections: AtomicUsize,
    next_connection_id: AtomicU64,
}

/// Start the proxy server.
///
/// Binds to `config.bind_addr:config.bind_port` (port 0 = OS-assigned) and
/// begins accepting connections.
///
/// Returns a `ProxyHandle` with the assigned port. The server runs until
/// `shutdown()` is called.
pub async fn start(config: ProxyConfig) -> Result<ProxyHandle> {
    // Bind listener
    let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;

    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;
    let port = local_addr.port();

    info!("Proxy server listening on {}", local_addr);

    let pool: PoolHandle = TcpPool::new(&config.settings)?;
    let targets = Arc::new(DestinationOverrides::from_config(&config.targets)?);
    let dns = Arc::new(DnsTable::from_config(&config.dns));
    let compat = Arc::new(MemoryCompatStore::with_seed(
        config.auto_heal.clone(),
        &config.compatibility,
    ));
    let matcher = Arc::new(RuleMatcher::new(default_interceptors()?, &config.intercepts));
    debug!(
        "Loaded {} intercept rule(s), {} dns override(s), {} destination override(s)",
        config.intercepts.len(),
        dns.len(),
        targets.len()
    );

    let establisher = TunnelEstablisher::new(
        matcher,
        dns.clone(),
        compat.clone(),
        config.auto_heal.clone(),
        Arc::new(config.settings.clone()),
    );
    let builder = OutboundBuilder::new(Arc::clone(&targets), Some(Arc::clone(&pool)));

    // Shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(ProxyState {
        config,
        builder,
        establisher,
        targets: Arc::clone(&targets),
        dns,
        pool,
        active_connections: AtomicUsize::new(0),
        next_connection_id: AtomicU64::new(1),
    });

    // Spawn accept loop as a task within the current runtime.
    // The caller must keep this runtime driven.
    tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));

    Ok(ProxyHandle {
        port,
        targets,
        compat,
        state,
        shutdown_tx,
    })
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        // Connection limit enforcement
                        let max = state.config.max_connections;
                        if max > 0 {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= max {
                                warn!("Connection limit reached ({}/{}), rejecting {}", current, max, addr);
                                drop(stream);
                                continue;
                            }
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);
                        let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);

                        debug!("Accepted connection {} from {}", connection_id, addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state, connection_id).await {
                                debug!("Connection handler error: {}", e);
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Proxy server shutting down");
                    return;
                }
            }
        }
    }
}

/// Handle a single client connection.
///
/// Serves requests until the client closes or a response ends the
/// connection, then drops the connection's socket bindings.
async fn handle_connection(
    stream: TcpStream,
    state: &ProxyState,
    connection_id: u64,
) -> Result<()> {
    let mut client = BufReader::new(stream);
    let result = serve_requests(&mut client, state, connection_id).await;
    state.evict_bindings(connection_id);
    result
}

/// Read and dispatch request heads from one client:
/// - CONNECT method -> tunnel to the destination or a backend
/// - Other methods  -> interception pipeline, repeated while kept alive
async fn serve_requests(
    client: &mut BufReader<TcpStream>,
    state: &ProxyState,
    connection_id: u64,
) -> Result<()> {
    let max_header_size = state.config.settings.max_header_size;

    loop {
        let mut first_line = String::new();
        client.read_line(&mut first_line).await?;

        if first_line.is_empty() {
            return Ok(()); // Client disconnected
        }

        // Read remaining headers (up to empty line), with size limit to prevent OOM.
        let mut header_bytes = Vec::new();
        loop {
            let mut line = String::new();
            let n = client.read_line(&mut line).await?;
            if n == 0 || line.trim().is_empty() {
                break;
            }
            header_bytes.extend_from_slice(line.as_bytes());
            if header_bytes.len() > max_header_size {
                let response = "HTTP/1.1 431 Request Header Fields Too Large\r\n\r\n";
                client.write_all(response.as_bytes()).await?;
                return Ok(());
            }
        }

        let first_line = first_line.trim_end();
        let head = match InboundHead::parse(first_line, &header_bytes) {
            Ok(head) => head,
            Err(e) => {
                client
                    .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                    .await?;
                return Err(e);
            }
        };

        if head.is_connect() {
            let ctx = ConnectCtx {
                targets: &state.targets,
                dns: state.dns.as_ref(),
                connect_timeout: state.config.settings.connect_timeout(),
            };
            return connect::handle_connect(first_line, client, &ctx).await;
        }

        let request = match state.builder.build(&head, false, connection_id) {
            Ok(request) => request,
            Err(e) => {
                client
                    .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
                    .await?;
                return Err(e);
            }
        };

        let outcome = state.establisher.establish(client, request).await?;
        debug!("Connection {} request done: {:?}", connection_id, outcome);
        let http11 = head.version.eq_ignore_ascii_case("HTTP/1.1");
        match outcome {
            TunnelOutcome::Relayed {
                keep_alive: true, ..
            } if http11 => continue,
            TunnelOutcome::Relayed {
                keep_alive: true, ..
            } => {
                // HTTP/1.0 clients expect the close.
                client.shutdown().await?;
                return Ok(());
            }
            _ => return Ok(()),
        }
    }
}

impl ProxyState {
    fn evict_bindings(&self, connection_id: u64) {
        let mut evicted = self.pool.evict_bindings(connection_id);
        if let Some(unverified) = self.pool.unverified_variant() {
            evicted += unverified.evict_bindings(connection_id);
        }
        if evicted > 0 {
            debug!(
                "Dropped {} socket binding(s) of connection {}",
                evicted, connection_id
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{RequestReplaceRule, RuleConfig};
    use crate::interceptor::SUMMARY_HEADER;
    use crate::targets::ProxyTarget;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn read_response_head(sock: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            sock.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// One-shot HTTP origin: hands the request head to the test, answers `ok`.
    async fn origin() -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                sock.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });
        (port, task)
    }

    async fn send(proxy_port: u16, raw: &str) -> String {
        let mut sock = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        sock.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        sock.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_proxy_starts_and_binds() {
        let config = ProxyConfig::default();
        let handle = start(config).await.unwrap();

        // Port should be non-zero (OS-assigned)
        assert!(handle.port > 0);
        assert_eq!(handle.proxy_url(), format!("http://127.0.0.1:{}", handle.port));

        // Shutdown
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_intercepted_request_end_to_end() {
        let (origin_port, origin_task) = origin().await;

        let mut headers = BTreeMap::new();
        headers.insert("X-Debug".to_string(), "[remove]".to_string());
        headers.insert("X-Origin-Url".to_string(), "${url}".to_string());
        let mut config = ProxyConfig::default();
        config.intercepts.insert(
            "127.0.0.1".to_string(),
            RuleConfig {
                request_replace: Some(RequestReplaceRule {
                    headers: Some(headers),
                    do_download: false,
                }),
                ..Default::default()
            },
        );
        let handle = start(config).await.unwrap();

        let response = send(
            handle.port,
            &format!(
                "GET http://127.0.0.1:{0}/path HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nX-Debug: 1\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
                origin_port
            ),
        )
        .await;

        let seen = origin_task.await.unwrap();
        assert!(seen.starts_with("GET /path HTTP/1.1\r\n"));
        assert!(!seen.contains("x-debug"));
        assert!(!seen.contains("proxy-connection"));
        assert!(seen.contains(&format!("x-origin-url: http://127.0.0.1:{}/path\r\n", origin_port)));

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains(&format!("{}: headers\r\n", SUMMARY_HEADER)));
        assert!(response.ends_with("ok"));
        assert_eq!(handle.counters().relayed, 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_destination_override_redirects_request() {
        let (origin_port, origin_task) = origin().await;
        let mut headers = BTreeMap::new();
        headers.insert("X-Tag".to_string(), "yes".to_string());
        let mut config = ProxyConfig::default();
        config.intercepts.insert(
            "service.invalid".to_string(),
            RuleConfig {
                request_replace: Some(RequestReplaceRule {
                    headers: Some(headers),
                    do_download: false,
                }),
                ..Default::default()
            },
        );
        let handle = start(config).await.unwrap();

        let mut paths = BTreeMap::new();
        paths.insert(
            "^/api".to_string(),
            ProxyTarget::new(format!("http://127.0.0.1:{}", origin_port), "mirror"),
        );
        assert!(handle.targets().insert("service.invalid", paths).unwrap());

        let response = send(
            handle.port,
            "GET http://service.invalid/api/v1 HTTP/1.1\r\nHost: service.invalid\r\nConnection: close\r\n\r\n",
        )
        .await;
        let seen = origin_task.await.unwrap();
        assert!(seen.starts_with("GET /api/v1 HTTP/1.1\r\n"));
        // Rules of the requested domain still apply after the redirect.
        assert!(seen.contains("x-tag: yes\r\n"));
        assert!(response.contains(&format!("{}: headers\r\n", SUMMARY_HEADER)));
        assert!(response.ends_with("ok"));

        assert_eq!(handle.targets().remove_described("mirror"), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_ntlm_handshake_shares_one_upstream_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
        {
            let accepts = Arc::clone(&accepts);
            tokio::spawn(async move {
                loop {
                    let (sock, _) = listener.accept().await.unwrap();
                    accepts.fetch_add(1, Ordering::SeqCst);
                    let closed_tx = closed_tx.clone();
                    tokio::spawn(async move {
                        let mut sock = BufReader::new(sock);
                        let mut served = 0usize;
                        loop {
                            let mut line = String::new();
                            if sock.read_line(&mut line).await.unwrap_or(0) == 0 {
                                break;
                            }
                            if line == "\r\n" {
                                served += 1;
                                sock.write_all(
                                    b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: NTLM TlRMTVNTUAAC\r\nContent-Length: 0\r\n\r\n",
                                )
                                .await
                                .unwrap();
                            }
                        }
                        let _ = closed_tx.send(served);
                    });
                }
            });
        }

        let handle = start(ProxyConfig::default()).await.unwrap();
        let mut sock = TcpStream::connect(("127.0.0.1", handle.port)).await.unwrap();
        for token in ["TlRMTVNTUAAB", "TlRMTVNTUAAD"] {
            sock.write_all(
                format!(
                    "GET http://127.0.0.1:{0}/ HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nAuthorization: NTLM {1}\r\n\r\n",
                    origin_port, token
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            let head = read_response_head(&mut sock).await;
            assert!(head.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        }
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        // Closing the client releases the bound upstream socket.
        drop(sock);
        let served = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(served, 2);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(handle.counters().relayed, 2);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_http10_client_is_closed_after_relay() {
        let (origin_port, origin_task) = origin().await;
        let handle = start(ProxyConfig::default()).await.unwrap();
        let response = send(
            handle.port,
            &format!("GET http://127.0.0.1:{}/ HTTP/1.0\r\n\r\n", origin_port),
        )
        .await;
        origin_task.await.unwrap();
        assert!(response.ends_with("ok"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_through_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let handle = start(ProxyConfig::default()).await.unwrap();
        let mut sock = TcpStream::connect(("127.0.0.1", handle.port)).await.unwrap();
        // The first tunnelled bytes arrive together with the head.
        sock.write_all(
            format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\nping", echo_port).as_bytes(),
        )
        .await
        .unwrap();

        let expected = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        let mut head = vec![0u8; expected.len()];
        sock.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..], &expected[..]);
        let mut echo = [0u8; 4];
        sock.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let handle = start(ProxyConfig::default()).await.unwrap();
        let response = send(handle.port, "NONSENSE\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));

        let response = send(handle.port, "GET /no-host HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_head_gets_431() {
        let mut config = ProxyConfig::default();
        config.settings.max_header_size = 64;
        let handle = start(config).await.unwrap();

        let big = "x".repeat(100);
        let response = send(
            handle.port,
            &format!("GET http://a.invalid/ HTTP/1.1\r\nX-Big: {}\r\n\r\n", big),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 431"));
        handle.shutdown();
    }
}
