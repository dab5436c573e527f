//! Error types for the sidecar-proxy crate.

use thiserror::Error;

/// Errors that can occur while intercepting or tunneling a request.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Interceptor '{interceptor}' failed: {source}")]
    Interceptor {
        interceptor: String,
        #[source]
        source: Box<ProxyError>,
    },

    #[error("Invalid request description: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Tunnel to {host} failed: {source}")]
    Tunnel {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("Proxy shutdown")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of an outbound connection attempt.
///
/// Self-signed certificate failures are kept apart from other TLS failures
/// because they drive the compatibility auto-heal.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("DNS resolution failed for {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Upstream connection failed to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Upstream connection to {host} timed out")]
    Timeout { host: String },

    #[error("Self-signed certificate presented by {host}")]
    SelfSignedCertificate { host: String },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("Upstream proxy {proxy} refused tunnel to {host} with status {status}")]
    UpstreamProxy {
        proxy: String,
        host: String,
        status: u16,
    },
}

impl ConnectError {
    /// Whether this failure should mark the destination as "do not verify".
    #[must_use]
    pub fn is_self_signed(&self) -> bool {
        matches!(self, ConnectError::SelfSignedCertificate { .. })
    }
}

impl ProxyError {
    /// Wrap a hook failure with the name of the interceptor that raised it.
    pub fn interceptor(name: &str, source: ProxyError) -> Self {
        ProxyError::Interceptor {
            interceptor: name.to_string(),
            source: Box::new(source),
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
