//! The tunnel establisher.
//!
//! Drives one inbound request through the pipeline:
//!
//! ```text
//! RECEIVED -> CHAIN_RUN -> CONNECTING -> RESPONSE_RELAYED -> CLOSED
//!                                     -> UPGRADE_SWITCHED -> TUNNEL_ESTABLISHED -> CLOSED
//! any state -> ERROR -> CLOSED
//! ```
//!
//! A non-upgrade response is relayed head and body to the client. The client
//! is then closed unless both sides framed their messages and neither asked
//! for `Connection: close`, in which case the caller may read the next request
//! from it. A `101` response turns both connections into a transparent
//! byte pipe until either side closes. Nothing here retries.

use crate::audit::{self, ProxyMode};
use crate::compat::{self, CompatibilityStore};
use crate::config::{AutoHealPolicy, ProxySettings};
use crate::context::{RequestContext, RequestCounter};
use crate::dns::{self, DnsOverrideStore};
use crate::error::{ProxyError, Result};
use crate::interceptor::{ChainOutcome, InterceptorChain};
use crate::matcher::InterceptorMatcher;
use crate::pool::{self, Checkout};
use crate::request::OutboundRequest;
use crate::sink::{NoopSink, ResponseHead};
use crate::stream::{BoxedIo, Rewind, TunnelIo};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, warn};

/// Pipeline state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Received,
    ChainRun,
    Connecting,
    ResponseRelayed,
    UpgradeSwitched,
    TunnelEstablished,
    Closed,
    Error,
}

impl TunnelState {
    /// Whether the pipeline may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        match (self, next) {
            (Closed, _) => false,
            (Error, Closed) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Received, ChainRun)
            | (ChainRun, Connecting)
            | (ChainRun, Closed)
            | (Connecting, ResponseRelayed)
            | (Connecting, UpgradeSwitched)
            | (ResponseRelayed, Closed)
            | (UpgradeSwitched, TunnelEstablished)
            | (TunnelEstablished, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Received => "RECEIVED",
            TunnelState::ChainRun => "CHAIN_RUN",
            TunnelState::Connecting => "CONNECTING",
            TunnelState::ResponseRelayed => "RESPONSE_RELAYED",
            TunnelState::UpgradeSwitched => "UPGRADE_SWITCHED",
            TunnelState::TunnelEstablished => "TUNNEL_ESTABLISHED",
            TunnelState::Closed => "CLOSED",
            TunnelState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Records state transitions for one request.
#[derive(Debug)]
struct StateTracker {
    state: TunnelState,
    span: tracing::Span,
}

impl StateTracker {
    fn new(span: tracing::Span) -> Self {
        debug!(parent: &span, "state {}", TunnelState::Received);
        Self {
            state: TunnelState::Received,
            span,
        }
    }

    fn advance(&mut self, next: TunnelState) {
        if !self.state.can_transition_to(next) {
            warn!(parent: &self.span, "unexpected transition {} -> {}", self.state, next);
        }
        debug!(parent: &self.span, "state {} -> {}", self.state, next);
        self.state = next;
    }
}

/// How a request left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// An interceptor handled the request; nothing was sent upstream.
    Halted { interceptor: String },
    /// A non-upgrade response was relayed. With `keep_alive` the client was
    /// left open, positioned at its next request.
    Relayed { status: u16, keep_alive: bool },
    /// The connection was upgraded and piped until closed.
    Tunnelled { to_upstream: u64, to_client: u64 },
}

/// Turns inbound requests into relayed responses or tunnels.
pub struct TunnelEstablisher {
    matcher: Arc<dyn InterceptorMatcher>,
    dns: Arc<dyn DnsOverrideStore>,
    compat: Arc<dyn CompatibilityStore>,
    auto_heal: AutoHealPolicy,
    counter: Arc<RequestCounter>,
    settings: Arc<ProxySettings>,
}

impl TunnelEstablisher {
    pub fn new(
        matcher: Arc<dyn InterceptorMatcher>,
        dns: Arc<dyn DnsOverrideStore>,
        compat: Arc<dyn CompatibilityStore>,
        auto_heal: AutoHealPolicy,
        settings: Arc<ProxySettings>,
    ) -> Self {
        Self {
            matcher,
            dns,
            compat,
            auto_heal,
            counter: Arc::new(RequestCounter::default()),
            settings,
        }
    }

    /// Counters shared by every request served by this establisher.
    #[must_use]
    pub fn counter(&self) -> &Arc<RequestCounter> {
        &self.counter
    }

    /// Serve `request` for `client`.
    ///
    /// `client` must be positioned just past the inbound request head. It is
    /// shut down when this returns, except after a keep-alive relay.
    pub async fn establish<C: TunnelIo>(
        &self,
        client: &mut C,
        request: OutboundRequest,
    ) -> Result<TunnelOutcome> {
        self.counter.record_request();
        let mut ctx = RequestContext::new(
            request,
            Arc::clone(&self.counter),
            Arc::clone(&self.settings),
        );
        let mut tracker = StateTracker::new(ctx.span.clone());

        let result = self.run(client, &mut ctx, &mut tracker).await;
        match &result {
            Ok(TunnelOutcome::Halted { .. }) => self.counter.record_halted(),
            Ok(TunnelOutcome::Relayed { .. }) => self.counter.record_relayed(),
            Ok(TunnelOutcome::Tunnelled { .. }) => self.counter.record_upgraded(),
            Err(e) => {
                tracker.advance(TunnelState::Error);
                self.counter.record_failed();
                warn!(
                    parent: &ctx.span,
                    "Request failed: {}, error: {}",
                    ctx.request.display_url(),
                    e
                );
            }
        }

        if !matches!(result, Ok(TunnelOutcome::Relayed { keep_alive: true, .. })) {
            if let Err(e) = client.shutdown().await {
                debug!(parent: &ctx.span, "Client shutdown: {}", e);
            }
        }
        tracker.advance(TunnelState::Closed);
        result
    }

    async fn run<C: TunnelIo>(
        &self,
        client: &mut C,
        ctx: &mut RequestContext,
        tracker: &mut StateTracker,
    ) -> Result<TunnelOutcome> {
        let mut sink = NoopSink::new();

        tracker.advance(TunnelState::ChainRun);
        let chain = InterceptorChain::new(self.matcher.match_interceptors(&ctx.request));
        if let ChainOutcome::Halted(interceptor) = chain.run(ctx, &mut sink).await? {
            return Ok(TunnelOutcome::Halted { interceptor });
        }

        tracker.advance(TunnelState::Connecting);
        let request = &mut ctx.request;
        dns::apply_dns_override(request, self.dns.as_ref());
        compat::apply_tls_override(request, self.compat.as_ref());

        let header_names: Vec<&str> = request.headers.iter().map(|(name, _)| name).collect();
        audit::log_outbound(
            ProxyMode::Intercept,
            &request.display_url(),
            request.servername.as_deref(),
            &header_names,
        );

        let pool = request.agent.clone().ok_or_else(|| {
            ProxyError::InvalidRequest(format!("no connection pool for {}", request.destination()))
        })?;
        let Checkout {
            mut stream,
            binding,
            reused,
        } = match pool::checkout(&pool, request).await {
            Ok(checkout) => checkout,
            Err(e) => {
                compat::record_connect_failure(request, &e, self.compat.as_ref(), &self.auto_heal);
                return Err(e.into());
            }
        };
        if reused {
            debug!("Sending {} on bound socket", request.display_url());
        }

        let destination = request.destination();
        let tunnel_err = |source: io::Error| ProxyError::Tunnel {
            host: destination.clone(),
            source,
        };

        let client_in_step = send_request(client, &mut stream, request)
            .await
            .map_err(&tunnel_err)?;
        let (raw_head, rest) = read_head(&mut stream, self.settings.max_header_size)
            .await
            .map_err(&tunnel_err)?;
        let mut head = ResponseHead::parse(&raw_head)?;
        head.merge(&sink);

        if head.status == 101 {
            tracker.advance(TunnelState::UpgradeSwitched);
            // The connection now belongs to the tunnel.
            drop(binding);
            head.version = "HTTP/1.1".to_string();
            head.reason = "Switching Protocols".to_string();
            client
                .write_all(head.to_wire().as_bytes())
                .await
                .map_err(&tunnel_err)?;
            client.flush().await.map_err(&tunnel_err)?;

            let mut upstream = Rewind::new(stream, rest);
            if let Err(e) = client.tune_for_tunnel() {
                debug!("Could not tune client socket: {}", e);
            }
            if let Err(e) = upstream.tune_for_tunnel() {
                debug!("Could not tune upstream socket: {}", e);
            }

            tracker.advance(TunnelState::TunnelEstablished);
            let (to_upstream, to_client) = tokio::io::copy_bidirectional(client, &mut upstream)
                .await
                .map_err(&tunnel_err)?;
            audit::log_tunnel_closed(ProxyMode::Intercept, &destination, to_upstream, to_client);
            return Ok(TunnelOutcome::Tunnelled {
                to_upstream,
                to_client,
            });
        }

        tracker.advance(TunnelState::ResponseRelayed);
        client
            .write_all(head.to_wire().as_bytes())
            .await
            .map_err(&tunnel_err)?;

        let framing = BodyFraming::of(&request.method, &head);
        let mut upstream = BufReader::new(Rewind::new(stream, rest));
        relay_body(&mut upstream, client, framing)
            .await
            .map_err(&tunnel_err)?;
        client.flush().await.map_err(&tunnel_err)?;

        let drained = upstream.buffer().is_empty() && upstream.get_ref().pending() == 0;
        if let Some(binding) = binding {
            if framing != BodyFraming::UntilClose && drained {
                debug!("Returning socket to {} to its binding", destination);
                binding.release(upstream.into_inner().into_inner());
            }
        }

        let keep_alive = client_in_step
            && framing != BodyFraming::UntilClose
            && !asks_close(request.headers.get("connection").into_iter())
            && !asks_close(head.values("connection"));

        audit::log_relayed(&request.display_url(), head.status);
        Ok(TunnelOutcome::Relayed {
            status: head.status,
            keep_alive,
        })
    }
}

impl fmt::Debug for TunnelEstablisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelEstablisher")
            .field("auto_heal", &self.auto_heal)
            .field("settings", &self.settings)
            .field("counter", &self.counter.snapshot())
            .finish()
    }
}

/// Write the request head, then forward a framed request body.
///
/// Upgrade requests carry no body here; anything the client sends after the
/// head goes through the tunnel once it is established. Returns `false` when
/// bytes past the body were read from the client and dropped, so the client
/// stream can no longer carry another request.
async fn send_request<C: TunnelIo>(
    client: &mut C,
    upstream: &mut BoxedIo,
    request: &OutboundRequest,
) -> io::Result<bool> {
    let mut in_step = true;
    upstream.write_all(request.to_head().as_bytes()).await?;
    if !request.wants_upgrade() {
        if let Some(length) = request.headers.content_length() {
            let copied = tokio::io::copy(&mut (&mut *client).take(length), upstream).await?;
            if copied < length {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before sending the whole body",
                ));
            }
        } else if is_chunked(request.headers.get("transfer-encoding")) {
            let mut reader = BufReader::new(&mut *client);
            relay_chunked(&mut reader, upstream).await?;
            in_step = reader.buffer().is_empty();
        }
    }
    upstream.flush().await?;
    Ok(in_step)
}

fn asks_close<'a>(mut values: impl Iterator<Item = &'a str>) -> bool {
    values.any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("close")))
}

/// Read a response head, returning it and any bytes read past it.
async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_size: usize,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before sending a response head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Index just past the blank line ending a head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn is_chunked(transfer_encoding: Option<&str>) -> bool {
    transfer_encoding.is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    fn of(method: &str, head: &ResponseHead) -> Self {
        if method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304
        {
            return BodyFraming::None;
        }
        if head.is_chunked() {
            return BodyFraming::Chunked;
        }
        match head.content_length() {
            Some(length) => BodyFraming::Length(length),
            None => BodyFraming::UntilClose,
        }
    }
}

/// Stream a response body to the client unmodified.
async fn relay_body<R, W>(upstream: &mut R, client: &mut W, framing: BodyFraming) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(length) => {
            let copied = tokio::io::copy(&mut (&mut *upstream).take(length), client).await?;
            if copied < length {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before sending the whole body",
                ));
            }
            Ok(copied)
        }
        BodyFraming::Chunked => relay_chunked(upstream, client).await,
        BodyFraming::UntilClose => tokio::io::copy(upstream, client).await,
    }
}

/// Copy a chunked body verbatim, stopping after the last chunk's trailer.
async fn relay_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunked body ended early",
            ));
        }
        writer.write_all(&line).await?;
        total += line.len() as u64;

        let size_field = String::from_utf8_lossy(&line);
        let size_field = size_field.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_field, 16).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
        })?;

        if size == 0 {
            // Trailer section up to and including the blank line.
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    return Ok(total);
                }
                writer.write_all(&line).await?;
                total += line.len() as u64;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(total);
                }
            }
        }

        // Chunk data plus its CRLF.
        let expected = size.checked_add(2).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "chunk size out of range")
        })?;
        let copied = tokio::io::copy(&mut (&mut *reader).take(expected), writer).await?;
        if copied < expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunk truncated",
            ));
        }
        total += copied;
    }
}
