//! Outbound connection pools.
//!
//! A [`ConnectionPool`] is the opaque handle carried on a request as its
//! `agent`. It knows whether it verifies certificates, may expose a pre-built
//! variant that does not, and keeps named socket bindings so a multi-step
//! authentication handshake (NTLM, Negotiate) stays on one physical
//! connection.
//!
//! [`TcpPool`] is the real implementation: TCP (optionally chained through a
//! CONNECT proxy) plus rustls for `https:` destinations.

use crate::config::ProxySettings;
use crate::connect;
use crate::error::{ConnectError, ProxyError, Result};
use crate::request::OutboundRequest;
use crate::stream::BoxedIo;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Shared handle to a connection pool.
pub type PoolHandle = Arc<dyn ConnectionPool>;

/// Capability of an outbound connection pool.
#[async_trait]
pub trait ConnectionPool: Send + Sync + fmt::Debug {
    /// Whether connections from this pool verify server certificates.
    fn verifies_certificates(&self) -> bool;

    /// Pre-built sibling pool that skips certificate verification.
    fn unverified_variant(&self) -> Option<PoolHandle>;

    /// Binding name for a request that carries a `custom_socket_id`.
    fn socket_name(&self, request: &OutboundRequest) -> String {
        format!(
            "{}:{}:{}:{}",
            request.hostname,
            request.port,
            request.sni(),
            request.custom_socket_id.unwrap_or_default()
        )
    }

    /// Socket binding registered under `name` for `socket_id`, if the pool
    /// supports binding.
    fn binding(&self, socket_id: u64, name: &str) -> Option<Arc<SocketBinding>>;

    /// Drop every binding of `socket_id`, closing connections parked in
    /// them. Returns how many were removed.
    fn evict_bindings(&self, socket_id: u64) -> usize;

    /// Open a new connection for the fully resolved request.
    async fn connect(&self, request: &OutboundRequest) -> std::result::Result<BoxedIo, ConnectError>;
}

/// A named slot holding at most one idle connection.
///
/// The slot's lock is held for as long as a request uses the bound
/// connection, so a second request on the same binding waits until the
/// first one is done.
#[derive(Default)]
pub struct SocketBinding {
    slot: Arc<tokio::sync::Mutex<Option<BoxedIo>>>,
}

impl SocketBinding {
    /// Whether no request currently holds the binding.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.slot.try_lock().is_ok()
    }

    async fn acquire(&self) -> BindingGuard {
        BindingGuard(Arc::clone(&self.slot).lock_owned().await)
    }
}

impl fmt::Debug for SocketBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketBinding")
            .field("free", &self.is_free())
            .finish()
    }
}

/// Exclusive use of a socket binding.
pub struct BindingGuard(OwnedMutexGuard<Option<BoxedIo>>);

impl BindingGuard {
    /// Park a still-usable connection in the binding for the next request.
    pub fn release(mut self, stream: BoxedIo) {
        *self.0 = Some(stream);
    }
}

/// A connection checked out for one request.
pub struct Checkout {
    pub stream: BoxedIo,
    /// Held while the request runs; `None` for unbound requests.
    pub binding: Option<BindingGuard>,
    /// Whether the stream was an idle bound connection.
    pub reused: bool,
}

/// Get a connection for `request` from `pool`.
///
/// Requests carrying a `custom_socket_id` go through the pool's socket
/// binding: the call waits until the binding is free, then reuses its idle
/// connection or opens a new one.
pub async fn checkout(
    pool: &PoolHandle,
    request: &OutboundRequest,
) -> std::result::Result<Checkout, ConnectError> {
    let binding = request
        .custom_socket_id
        .and_then(|socket_id| pool.binding(socket_id, &pool.socket_name(request)));

    let Some(binding) = binding else {
        return Ok(Checkout {
            stream: pool.connect(request).await?,
            binding: None,
            reused: false,
        });
    };

    if !binding.is_free() {
        debug!("Waiting for bound socket to {} to become free", request.destination());
    }
    let mut guard = binding.acquire().await;
    match guard.0.take() {
        Some(stream) => {
            debug!("Reusing bound socket to {}", request.destination());
            Ok(Checkout {
                stream,
                binding: Some(guard),
                reused: true,
            })
        }
        None => Ok(Checkout {
            stream: pool.connect(request).await?,
            binding: Some(guard),
            reused: false,
        }),
    }
}

/// TCP + rustls connection pool.
pub struct TcpPool {
    verify: bool,
    tls_connector: TlsConnector,
    connect_timeout: Duration,
    unverified: Option<PoolHandle>,
    /// Socket id to binding name to binding.
    bindings: Mutex<HashMap<u64, HashMap<String, Arc<SocketBinding>>>>,
}

impl TcpPool {
    /// Build a pool from the proxy settings.
    ///
    /// When verification is enabled the pool carries a pre-built unverified
    /// sibling for the compatibility store to switch to.
    pub fn new(settings: &ProxySettings) -> Result<Arc<Self>> {
        // Use the ring provider explicitly to avoid ambiguity when multiple
        // crypto providers are in the dependency tree.
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let unverified = Arc::new(Self::build(
            false,
            Arc::clone(&provider),
            settings.connect_timeout(),
            None,
        )?);
        if !settings.verify_certificates {
            return Ok(unverified);
        }
        let sibling: PoolHandle = unverified;
        Ok(Arc::new(Self::build(
            true,
            provider,
            settings.connect_timeout(),
            Some(sibling),
        )?))
    }

    fn build(
        verify: bool,
        provider: Arc<CryptoProvider>,
        connect_timeout: Duration,
        unverified: Option<PoolHandle>,
    ) -> Result<Self> {
        let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Config(format!("TLS config error: {}", e)))?;
        let tls_config = if verify {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        };

        Ok(Self {
            verify,
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
            connect_timeout,
            unverified,
            bindings: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl ConnectionPool for TcpPool {
    fn verifies_certificates(&self) -> bool {
        self.verify
    }

    fn unverified_variant(&self) -> Option<PoolHandle> {
        self.unverified.clone()
    }

    fn binding(&self, socket_id: u64, name: &str) -> Option<Arc<SocketBinding>> {
        let mut bindings = self.bindings.lock();
        let named = bindings.entry(socket_id).or_default();
        Some(Arc::clone(named.entry(name.to_string()).or_default()))
    }

    fn evict_bindings(&self, socket_id: u64) -> usize {
        self.bindings
            .lock()
            .remove(&socket_id)
            .map_or(0, |named| named.len())
    }

    async fn connect(&self, request: &OutboundRequest) -> std::result::Result<BoxedIo, ConnectError> {
        let tcp = match request.upstream_proxy.as_deref() {
            Some(proxy) => {
                let (proxy_host, proxy_port) =
                    connect::split_authority(proxy, 80).map_err(|e| ConnectError::Connect {
                        host: proxy.to_string(),
                        reason: e.to_string(),
                    })?;
                let mut stream =
                    connect::dial(&proxy_host, proxy_port, None, self.connect_timeout).await?;
                connect::open_tunnel(&mut stream, proxy, &request.hostname, request.port).await?;
                stream
            }
            None => {
                connect::dial(
                    &request.hostname,
                    request.port,
                    request.lookup.as_ref(),
                    self.connect_timeout,
                )
                .await?
            }
        };

        if !request.protocol.is_tls() {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(request.sni().to_string()).map_err(|_| {
            ConnectError::Tls {
                host: request.hostname.clone(),
                reason: "invalid server name for TLS".to_string(),
            }
        })?;

        match self.tls_connector.connect(server_name, tcp).await {
            Ok(tls_stream) => Ok(Box::new(tls_stream)),
            Err(e) => Err(classify_tls_error(&request.hostname, e)),
        }
    }
}

impl fmt::Debug for TcpPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPool")
            .field("verify", &self.verify)
            .field("connect_timeout", &self.connect_timeout)
            .field("unverified", &self.unverified.is_some())
            .field(
                "bindings",
                &self.bindings.lock().values().map(HashMap::len).sum::<usize>(),
            )
            .finish()
    }
}

/// Map a handshake failure onto [`ConnectError`].
///
/// webpki reports a self-signed leaf as an unknown issuer.
fn classify_tls_error(host: &str, err: std::io::Error) -> ConnectError {
    let self_signed = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|tls_err| {
            matches!(
                tls_err,
                rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer)
            )
        });
    if self_signed {
        ConnectError::SelfSignedCertificate {
            host: host.to_string(),
        }
    } else {
        ConnectError::Tls {
            host: host.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Certificate verifier for destinations marked "do not verify".
///
/// Handshake signatures are still checked; only the chain of trust is
/// skipped.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
