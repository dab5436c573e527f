//! Proxy configuration types.
//!
//! Defines the configuration for the proxy server: listener settings, the
//! per-domain interception rules, DNS overrides, destination overrides and
//! the certificate-verification auto-heal policy.

use crate::compat::CompatDecision;
use crate::targets::ProxyTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// Configuration for the proxy server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (0 = OS-assigned ephemeral port)
    #[serde(default)]
    pub bind_port: u16,

    /// Maximum concurrent connections (0 = unlimited).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Static settings handed to every request context.
    #[serde(default)]
    pub settings: ProxySettings,

    /// Per-hostname DNS overrides.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Interception rules keyed by domain (`example.com` or `*.example.com`).
    #[serde(default)]
    pub intercepts: BTreeMap<String, RuleConfig>,

    /// Destination overrides: domain -> path pattern -> target.
    #[serde(default)]
    pub targets: BTreeMap<String, BTreeMap<String, ProxyTarget>>,

    /// Seed decisions for the certificate compatibility store, keyed by
    /// `host:port`.
    #[serde(default)]
    pub compatibility: BTreeMap<String, CompatDecision>,

    /// Failure-driven certificate verification downgrade.
    #[serde(default)]
    pub auto_heal: AutoHealPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: 0,
            max_connections: default_max_connections(),
            settings: ProxySettings::default(),
            dns: DnsConfig::default(),
            intercepts: BTreeMap::new(),
            targets: BTreeMap::new(),
            compatibility: BTreeMap::new(),
            auto_heal: AutoHealPolicy::default(),
        }
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

fn default_max_connections() -> usize {
    256
}

/// Settings shared read-only by every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Timeout for a single upstream TCP connect, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Maximum total size of a request or response head.
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,

    /// Verify upstream certificates unless the compatibility store says
    /// otherwise.
    #[serde(default = "default_true")]
    pub verify_certificates: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            max_header_size: default_max_header_size(),
            verify_certificates: true,
        }
    }
}

impl ProxySettings {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

/// DNS override table configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Hostname (or the catch-all `ForSNI` key) to resolver entry.
    #[serde(default)]
    pub map: BTreeMap<String, DnsEntry>,
}

/// A fixed-address resolver entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsEntry {
    /// Resolver name used in logs.
    pub name: String,
    /// Addresses returned for any hostname routed to this entry.
    pub addresses: Vec<IpAddr>,
}

/// The rule configuration matched for a request.
///
/// Each interceptor owns one section key. Sections without a typed field are
/// kept as raw JSON so other interceptors can read them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    /// Header rewrite and download conversion section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_replace: Option<RequestReplaceRule>,

    #[serde(flatten)]
    pub sections: BTreeMap<String, serde_json::Value>,
}

impl RuleConfig {
    /// Whether the rule carries the given section key.
    #[must_use]
    pub fn has_section(&self, key: &str) -> bool {
        match key {
            "requestReplace" => self.request_replace.is_some(),
            other => self.sections.contains_key(other),
        }
    }
}

/// Configuration of the header/variable rewriter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReplaceRule {
    /// Header name to replacement value. The value `[remove]` deletes the
    /// header; other values may contain `${...}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    /// Convert marked requests into file downloads.
    #[serde(default)]
    pub do_download: bool,
}

/// Policy for the failure-driven certificate verification downgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoHealPolicy {
    /// Record "do not verify" after a self-signed certificate failure.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Forget a recorded downgrade after this many seconds.
    /// `None` keeps it until reset externally.
    #[serde(default)]
    pub expire_after_secs: Option<u64>,
}

impl Default for AutoHealPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_after_secs: None,
        }
    }
}

impl AutoHealPolicy {
    #[must_use]
    pub fn expire_after(&self) -> Option<Duration> {
        self.expire_after_secs.map(Duration::from_secs)
    }
}
