//! Destination-override table.
//!
//! Maps a domain and a path pattern to a replacement destination. Backends
//! register their entries here (tagged with a description so they can be
//! removed again); the outbound builder is the only reader.

use crate::error::{ProxyError, Result};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One destination override.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTarget {
    /// `<scheme>://<host>:<port>` with scheme `http`, `https` or `tunnel`.
    pub proxy_target: String,
    #[serde(default)]
    pub description: String,
}

impl ProxyTarget {
    pub fn new(proxy_target: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            proxy_target: proxy_target.into(),
            description: description.into(),
        }
    }

    /// Parse the target URL.
    pub fn endpoint(&self) -> Result<TargetEndpoint> {
        TargetEndpoint::parse(&self.proxy_target)
    }
}

/// How an override redirects the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
    /// Keep the destination; chain through a CONNECT proxy at the endpoint.
    Tunnel,
}

/// Parsed form of [`ProxyTarget::proxy_target`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEndpoint {
    pub scheme: TargetScheme,
    pub host: String,
    pub port: u16,
}

impl TargetEndpoint {
    pub fn parse(target: &str) -> Result<Self> {
        let parsed = url::Url::parse(target)
            .map_err(|e| ProxyError::Config(format!("invalid proxy target '{}': {}", target, e)))?;

        let (scheme, default_port) = match parsed.scheme() {
            "http" => (TargetScheme::Http, 80),
            "https" => (TargetScheme::Https, 443),
            "tunnel" => (TargetScheme::Tunnel, 0),
            other => {
                return Err(ProxyError::Config(format!(
                    "unsupported proxy target scheme '{}' in {}",
                    other, target
                )))
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("missing host in proxy target: {}", target)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = parsed.port().unwrap_or(default_port);
        if port == 0 {
            return Err(ProxyError::Config(format!(
                "proxy target needs an explicit port: {}",
                target
            )));
        }

        Ok(Self { scheme, host, port })
    }

    /// `host:port` of the endpoint, bracketing IPv6 literals.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

struct PathRule {
    pattern: Regex,
    source: String,
    target: ProxyTarget,
}

/// Thread-safe domain -> path pattern -> target table.
#[derive(Default)]
pub struct DestinationOverrides {
    domains: RwLock<BTreeMap<String, Vec<PathRule>>>,
}

impl DestinationOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from configuration, rejecting invalid path patterns.
    pub fn from_config(config: &BTreeMap<String, BTreeMap<String, ProxyTarget>>) -> Result<Self> {
        let table = Self::new();
        for (domain, paths) in config {
            if !table.insert(domain, paths.clone())? {
                return Err(ProxyError::Config(format!(
                    "duplicate destination override for {}",
                    domain
                )));
            }
        }
        Ok(table)
    }

    /// Register the path rules for `domain`.
    ///
    /// An existing entry for the domain is never overwritten: the conflict is
    /// logged and `false` returned.
    pub fn insert(&self, domain: &str, paths: BTreeMap<String, ProxyTarget>) -> Result<bool> {
        let key = domain.to_ascii_lowercase();
        let mut rules = Vec::with_capacity(paths.len());
        for (source, target) in paths {
            let pattern = Regex::new(&source).map_err(|e| {
                ProxyError::Config(format!("invalid path pattern '{}' for {}: {}", source, domain, e))
            })?;
            rules.push(PathRule {
                pattern,
                source,
                target,
            });
        }

        let mut domains = self.domains.write();
        if let Some(existing) = domains.get(&key) {
            let same = existing.len() == rules.len()
                && existing
                    .iter()
                    .zip(&rules)
                    .all(|(a, b)| a.source == b.source && a.target == b.target);
            if same {
                debug!("Destination override for {} already registered", key);
            } else {
                warn!("Destination override for {} conflicts with an existing entry", key);
            }
            return Ok(false);
        }
        domains.insert(key, rules);
        Ok(true)
    }

    /// Remove every entry carrying `description`. Returns the number of
    /// path rules removed.
    pub fn remove_described(&self, description: &str) -> usize {
        let mut removed = 0;
        let mut domains = self.domains.write();
        domains.retain(|_, rules| {
            let before = rules.len();
            rules.retain(|rule| rule.target.description != description);
            removed += before - rules.len();
            !rules.is_empty()
        });
        removed
    }

    /// First target whose domain equals `host` and whose pattern matches
    /// `path`.
    #[must_use]
    pub fn resolve(&self, host: &str, path: &str) -> Option<ProxyTarget> {
        let domains = self.domains.read();
        domains
            .get(&host.to_ascii_lowercase())?
            .iter()
            .find(|rule| rule.pattern.is_match(path))
            .map(|rule| rule.target.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }
}

impl std::fmt::Debug for DestinationOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let domains = self.domains.read();
        f.debug_map()
            .entries(
                domains
                    .iter()
                    .map(|(domain, rules)| (domain, rules.iter().map(|r| &r.source).collect::<Vec<_>>())),
            )
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn paths(pattern: &str, target: &str, description: &str) -> BTreeMap<String, ProxyTarget> {
        let mut paths = BTreeMap::new();
        paths.insert(pattern.to_string(), ProxyTarget::new(target, description));
        paths
    }

    #[test]
    fn test_endpoint_parse() {
        let tunnel = TargetEndpoint::parse("tunnel://127.0.0.1:10801").unwrap();
        assert_eq!(tunnel.scheme, TargetScheme::Tunnel);
        assert_eq!(tunnel.authority(), "127.0.0.1:10801");

        let https = TargetEndpoint::parse("https://mirror.example").unwrap();
        assert_eq!(https.scheme, TargetScheme::Https);
        assert_eq!(https.port, 443);

        assert!(TargetEndpoint::parse("tunnel://127.0.0.1").is_err());
        assert!(TargetEndpoint::parse("ftp://x:21").is_err());
        assert!(TargetEndpoint::parse("not a url").is_err());
    }

    #[test]
    fn test_resolve_first_matching_pattern() {
        let table = DestinationOverrides::new();
        let mut rules = paths("^/api/", "http://127.0.0.1:8080", "local");
        rules.insert(".*".to_string(), ProxyTarget::new("tunnel://127.0.0.1:10801", "ssr"));
        assert!(table.insert("OpenAI.com", rules).unwrap());

        assert_eq!(
            table.resolve("openai.com", "/v1/chat").unwrap().proxy_target,
            "tunnel://127.0.0.1:10801"
        );
        assert!(table.resolve("other.com", "/").is_none());
    }

    #[test]
    fn test_insert_refuses_conflict() {
        let table = DestinationOverrides::new();
        assert!(table
            .insert("a.com", paths(".*", "http://127.0.0.1:1", "one"))
            .unwrap());
        assert!(!table
            .insert("a.com", paths(".*", "http://127.0.0.1:2", "two"))
            .unwrap());
        assert_eq!(
            table.resolve("a.com", "/").unwrap().proxy_target,
            "http://127.0.0.1:1"
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let table = DestinationOverrides::new();
        assert!(table.insert("a.com", paths("(", "http://x:1", "d")).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_described() {
        let table = DestinationOverrides::new();
        table
            .insert("a.com", paths(".*", "tunnel://127.0.0.1:1", "backend"))
            .unwrap();
        table
            .insert("b.com", paths(".*", "http://127.0.0.1:2", "static"))
            .unwrap();

        assert_eq!(table.remove_described("backend"), 1);
        assert!(table.resolve("a.com", "/").is_none());
        assert!(table.resolve("b.com", "/").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_targets_compare_structurally() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ProxyTarget::new("http://x:1", "d"));
        set.insert(ProxyTarget::new("http://x:1", "d"));
        assert_eq!(set.len(), 1);
    }
}
