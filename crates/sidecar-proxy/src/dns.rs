//! Per-request DNS overrides.
//!
//! The override table maps hostnames to resolvers. A request whose hostname
//! has no entry but which carries an SNI value falls back to the catch-all
//! [`SNI_FALLBACK_KEY`] entry. Every decision is logged.

use crate::audit;
use crate::config::DnsConfig;
use crate::request::OutboundRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Catch-all table key consulted for SNI requests without a host entry.
pub const SNI_FALLBACK_KEY: &str = "ForSNI";

/// A DNS resolution function installed on a request.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolver name used in logs.
    fn name(&self) -> &str;

    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Source of DNS overrides, keyed by hostname.
pub trait DnsOverrideStore: Send + Sync {
    fn lookup(&self, hostname: &str) -> Option<Arc<dyn Resolve>>;
}

/// Resolver that answers every query with a fixed address list.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    name: String,
    addresses: Vec<IpAddr>,
}

impl StaticResolver {
    pub fn new(name: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if self.addresses.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("resolver {} has no address for {}", self.name, host),
            ));
        }
        Ok(self
            .addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect())
    }
}

/// In-memory DNS override table built from [`DnsConfig`].
#[derive(Default)]
pub struct DnsTable {
    entries: HashMap<String, Arc<dyn Resolve>>,
}

impl DnsTable {
    #[must_use]
    pub fn from_config(config: &DnsConfig) -> Self {
        let entries = config
            .map
            .iter()
            .map(|(host, entry)| {
                let resolver: Arc<dyn Resolve> =
                    Arc::new(StaticResolver::new(&entry.name, entry.addresses.clone()));
                (host.to_ascii_lowercase(), resolver)
            })
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, hostname: &str, resolver: Arc<dyn Resolve>) {
        self.entries.insert(hostname.to_ascii_lowercase(), resolver);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DnsOverrideStore for DnsTable {
    fn lookup(&self, hostname: &str) -> Option<Arc<dyn Resolve>> {
        self.entries.get(&hostname.to_ascii_lowercase()).cloned()
    }
}

impl fmt::Debug for DnsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v.name())))
            .finish()
    }
}

/// Which path the DNS override decision took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsDecision {
    /// The hostname has its own entry.
    Host(String),
    /// No host entry; the SNI catch-all was used.
    SniFallback(String),
    /// No override; system resolution.
    System,
}

/// Install a DNS override on `request` if the store has one.
pub fn apply_dns_override(request: &mut OutboundRequest, store: &dyn DnsOverrideStore) -> DnsDecision {
    let explicit = if request.hostname.eq_ignore_ascii_case(SNI_FALLBACK_KEY) {
        None
    } else {
        store.lookup(&request.hostname)
    };

    let decision = match explicit {
        Some(resolver) => {
            let decision = DnsDecision::Host(resolver.name().to_string());
            request.lookup = Some(resolver);
            decision
        }
        None if request.servername.is_some() => match store.lookup(SNI_FALLBACK_KEY) {
            Some(resolver) => {
                let decision = DnsDecision::SniFallback(resolver.name().to_string());
                request.lookup = Some(resolver);
                decision
            }
            None => DnsDecision::System,
        },
        None => DnsDecision::System,
    };

    audit::log_dns_decision(&request.hostname, request.servername.as_deref(), &decision);
    decision
}

/// Resolve `host:port` through the override if present, the system otherwise.
pub async fn resolve(
    lookup: Option<&Arc<dyn Resolve>>,
    host: &str,
    port: u16,
) -> io::Result<Vec<SocketAddr>> {
    match lookup {
        Some(resolver) => resolver.resolve(host, port).await,
        None => Ok(tokio::net::lookup_host((host, port)).await?.collect()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::DnsEntry;
    use crate::request::Protocol;
    use std::net::Ipv4Addr;

    fn table() -> DnsTable {
        let mut config = DnsConfig::default();
        config.map.insert(
            "github.com".to_string(),
            DnsEntry {
                name: "cloudflare".to_string(),
                addresses: vec![IpAddr::V4(Ipv4Addr::new(140, 82, 112, 3))],
            },
        );
        config.map.insert(
            SNI_FALLBACK_KEY.to_string(),
            DnsEntry {
                name: "quad9".to_string(),
                addresses: vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))],
            },
        );
        DnsTable::from_config(&config)
    }

    fn request(host: &str) -> OutboundRequest {
        OutboundRequest::new("GET", Protocol::Https, host, 443, "/").unwrap()
    }

    #[test]
    fn test_explicit_host_entry() {
        let mut req = request("GitHub.com");
        req.servername = Some("front.example".to_string());
        let decision = apply_dns_override(&mut req, &table());
        assert_eq!(decision, DnsDecision::Host("cloudflare".to_string()));
        assert_eq!(req.lookup.as_ref().unwrap().name(), "cloudflare");
    }

    #[test]
    fn test_sni_fallback() {
        let mut req = request("unknown.example");
        req.servername = Some("front.example".to_string());
        let decision = apply_dns_override(&mut req, &table());
        assert_eq!(decision, DnsDecision::SniFallback("quad9".to_string()));
        assert!(req.lookup.is_some());
    }

    #[test]
    fn test_no_override_without_sni() {
        let mut req = request("unknown.example");
        assert_eq!(apply_dns_override(&mut req, &table()), DnsDecision::System);
        assert!(req.lookup.is_none());
    }

    #[test]
    fn test_sni_without_catch_all() {
        let mut req = request("unknown.example");
        req.servername = Some("front.example".to_string());
        let decision = apply_dns_override(&mut req, &DnsTable::default());
        assert_eq!(decision, DnsDecision::System);
    }

    #[tokio::test]
    async fn test_static_resolver_uses_request_port() {
        let resolver = StaticResolver::new("fixed", vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let addrs = resolver.resolve("anything", 8443).await.unwrap();
        assert_eq!(addrs, vec![SocketAddr::from(([127, 0, 0, 1], 8443))]);

        let empty = StaticResolver::new("empty", Vec::new());
        assert!(empty.resolve("anything", 80).await.is_err());
    }
}
