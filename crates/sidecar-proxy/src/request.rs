//! The outbound request description threaded through the pipeline.
//!
//! One [`OutboundRequest`] exists per inbound request. It is owned by the
//! task handling that request and dropped when the request ends.

use crate::dns::Resolve;
use crate::error::{ProxyError, Result};
use crate::pool::PoolHandle;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Outbound protocol. Displays as `http:` / `https:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// Port used when none is given.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    #[must_use]
    pub fn is_tls(self) -> bool {
        self == Protocol::Https
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http:"),
            Protocol::Https => write!(f, "https:"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ProxyError;

    /// Accepts `http:`/`https:` as well as bare scheme names.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim_end_matches(':').to_ascii_lowercase().as_str() {
            "http" | "ws" => Ok(Protocol::Http),
            "https" | "wss" => Ok(Protocol::Https),
            _ => Err(ProxyError::InvalidRequest(format!(
                "unsupported protocol: {}",
                s
            ))),
        }
    }
}

/// Request headers keyed by lower-cased name.
///
/// Every insertion and lookup lower-cases the key, so a name is never stored
/// twice under different casings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Set a header, returning the previous value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.to_ascii_lowercase(), value.into())
    }

    /// Add a value, joining repeated headers with `, `.
    pub fn append(&mut self, name: &str, value: &str) {
        self.0
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parsed `content-length`, if present and valid.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

/// Destination and headers as first resolved, before any interceptor ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub method: String,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub headers: Headers,
}

/// Mutable description of where and how a request leaves the proxy.
pub struct OutboundRequest {
    pub method: String,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub headers: Headers,
    /// Connection pool used for the outbound connection.
    pub agent: Option<PoolHandle>,
    /// TLS SNI value; falls back to `hostname` when unset.
    pub servername: Option<String>,
    /// Per-request DNS override.
    pub lookup: Option<Arc<dyn Resolve>>,
    /// Correlates this request with a bound pooled socket.
    pub custom_socket_id: Option<u64>,
    /// Set when the response should be turned into a file download.
    pub do_download: bool,
    /// CONNECT proxy (`host:port`) the outbound connection is chained through.
    pub upstream_proxy: Option<String>,
    original: Option<Snapshot>,
}

impl OutboundRequest {
    /// Create a description for `method protocol//hostname:port path`.
    ///
    /// Port 0 is rejected.
    pub fn new(
        method: &str,
        protocol: Protocol,
        hostname: &str,
        port: u16,
        path: &str,
    ) -> Result<Self> {
        if port == 0 {
            return Err(ProxyError::InvalidRequest(format!(
                "port must be positive for {}",
                hostname
            )));
        }
        if hostname.is_empty() {
            return Err(ProxyError::InvalidRequest("empty hostname".to_string()));
        }
        Ok(Self {
            method: method.to_string(),
            protocol,
            hostname: hostname.to_string(),
            port,
            path: if path.is_empty() {
                "/".to_string()
            } else {
                path.to_string()
            },
            headers: Headers::new(),
            agent: None,
            servername: None,
            lookup: None,
            custom_socket_id: None,
            do_download: false,
            upstream_proxy: None,
            original: None,
        })
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Capture the original snapshot. Only the first call has an effect;
    /// returns whether this call captured it.
    pub fn capture_original(&mut self) -> bool {
        if self.original.is_some() {
            return false;
        }
        self.original = Some(Snapshot {
            method: self.method.clone(),
            protocol: self.protocol,
            hostname: self.hostname.clone(),
            port: self.port,
            path: self.path.clone(),
            headers: self.headers.clone(),
        });
        true
    }

    #[must_use]
    pub fn original(&self) -> Option<&Snapshot> {
        self.original.as_ref()
    }

    /// `host:port` key identifying the destination.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Name presented in the TLS handshake.
    #[must_use]
    pub fn sni(&self) -> &str {
        self.servername.as_deref().unwrap_or(&self.hostname)
    }

    /// `METHOD ➜ protocol//host:port/path` for log lines.
    #[must_use]
    pub fn display_url(&self) -> String {
        format!(
            "{} ➜ {}//{}:{}{}",
            self.method, self.protocol, self.hostname, self.port, self.path
        )
    }

    /// Whether the request asks for a protocol upgrade.
    #[must_use]
    pub fn wants_upgrade(&self) -> bool {
        self.headers.contains("upgrade")
    }

    /// Serialize the request line and headers for the wire.
    ///
    /// When sent through a plain-HTTP upstream proxy the absolute form is not
    /// used; tunnels are always opened with CONNECT first.
    #[must_use]
    pub fn to_head(&self) -> String {
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        if !self.headers.contains("host") {
            if self.port == self.protocol.default_port() {
                head.push_str(&format!("host: {}\r\n", self.hostname));
            } else {
                head.push_str(&format!("host: {}:{}\r\n", self.hostname, self.port));
            }
        }
        for (name, value) in self.headers.iter() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        head
    }
}

impl fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("method", &self.method)
            .field("protocol", &self.protocol)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("agent", &self.agent.is_some())
            .field("servername", &self.servername)
            .field("lookup", &self.lookup.as_ref().map(|l| l.name().to_string()))
            .field("custom_socket_id", &self.custom_socket_id)
            .field("do_download", &self.do_download)
            .field("upstream_proxy", &self.upstream_proxy)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_normalize_case() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));

        let previous = headers.insert("CONTENT-type", "application/json");
        assert_eq!(previous.as_deref(), Some("text/plain"));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.iter().next().unwrap().0, "content-type");
    }

    #[test]
    fn test_headers_append_joins_values() {
        let headers: Headers = [("Accept", "a"), ("accept", "b")].into_iter().collect();
        assert_eq!(headers.get("accept"), Some("a, b"));
    }

    #[test]
    fn test_content_length() {
        let mut headers = Headers::new();
        assert_eq!(headers.content_length(), None);
        headers.insert("Content-Length", " 42");
        assert_eq!(headers.content_length(), Some(42));
    }

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!("https:".parse::<Protocol>().unwrap(), Protocol::Https);
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("WSS".parse::<Protocol>().unwrap(), Protocol::Https);
        assert!("ftp:".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Http.to_string(), "http:");
        assert_eq!(Protocol::Https.default_port(), 443);
    }

    #[test]
    fn test_port_zero_rejected() {
        assert!(OutboundRequest::new("GET", Protocol::Http, "example.com", 0, "/").is_err());
        assert!(OutboundRequest::new("GET", Protocol::Http, "", 80, "/").is_err());
    }

    #[test]
    fn test_original_is_write_once() {
        let mut req = OutboundRequest::new("GET", Protocol::Https, "a.com", 443, "/x").unwrap();
        assert!(req.original().is_none());
        assert!(req.capture_original());

        req.hostname = "b.com".to_string();
        assert!(!req.capture_original());
        assert_eq!(req.original().unwrap().hostname, "a.com");
    }

    #[test]
    fn test_to_head_adds_host() {
        let mut req = OutboundRequest::new("GET", Protocol::Http, "a.com", 8080, "/ws").unwrap();
        req.headers.insert("Upgrade", "websocket");
        let head = req.to_head();
        assert!(head.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(head.contains("host: a.com:8080\r\n"));
        assert!(head.contains("upgrade: websocket\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert!(req.wants_upgrade());
    }

    #[test]
    fn test_sni_falls_back_to_hostname() {
        let mut req = OutboundRequest::new("GET", Protocol::Https, "a.com", 443, "/").unwrap();
        assert_eq!(req.sni(), "a.com");
        req.servername = Some("front.example".to_string());
        assert_eq!(req.sni(), "front.example");
        assert_eq!(req.destination(), "a.com:443");
    }
}
