//! Header and placeholder rewriting.
//!
//! Rewrites request headers from the rule's header map and turns requests
//! carrying the download marker into download requests. The categories of
//! changes applied are reported in the [`SUMMARY_HEADER`] response header.

use super::{Flow, Interceptor};
use crate::config::{RequestReplaceRule, RuleConfig};
use crate::context::RequestContext;
use crate::error::{ProxyError, Result};
use crate::request::OutboundRequest;
use crate::sink::HeaderSink;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Header value that deletes the header.
pub const REMOVE_MARKER: &str = "[remove]";

/// Path token that marks a request for download conversion.
pub const DOWNLOAD_MARKER: &str = "SIDECAR_DOWNLOAD";

/// Response header listing the applied change categories.
pub const SUMMARY_HEADER: &str = "Sidecar-RequestReplace-Interceptor";

const SECTION: &str = "requestReplace";

/// The `requestReplace` interceptor.
#[derive(Debug)]
pub struct RequestReplace {
    marker_suffix: Regex,
}

impl RequestReplace {
    pub const NAME: &'static str = SECTION;
    pub const PRIORITY: i32 = 111;

    pub fn new() -> Result<Self> {
        let pattern = format!(r"(?i)[?&/]?{}(=[^?&/]+)?$", DOWNLOAD_MARKER);
        let marker_suffix = Regex::new(&pattern)
            .map_err(|e| ProxyError::Config(format!("invalid download marker pattern: {}", e)))?;
        Ok(Self { marker_suffix })
    }

    /// Strip the trailing download marker from `request.path` and flag the
    /// request. Returns whether the marker was present.
    fn convert_download(&self, request: &mut OutboundRequest) -> bool {
        if !request
            .path
            .to_ascii_uppercase()
            .contains(DOWNLOAD_MARKER)
        {
            return false;
        }
        request.do_download = true;
        let stripped = self.marker_suffix.replace(&request.path, "").into_owned();
        debug!("Download marker stripped: '{}' -> '{}'", request.path, stripped);
        request.path = if stripped.is_empty() {
            "/".to_string()
        } else {
            stripped
        };
        true
    }
}

#[async_trait]
impl Interceptor for RequestReplace {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn is_applicable(&self, rule: &RuleConfig) -> bool {
        rule.has_section(SECTION)
    }

    async fn intercept(
        &self,
        ctx: &mut RequestContext,
        rule: &RuleConfig,
        sink: &mut dyn HeaderSink,
    ) -> Result<Flow> {
        let Some(config) = rule.request_replace.as_ref() else {
            return Ok(Flow::Next);
        };
        let actions = self.apply(&mut ctx.request, config);
        sink.set_header(SUMMARY_HEADER, &actions.join(","));
        info!("requestReplace intercept: {}", ctx.request.display_url());
        Ok(Flow::Next)
    }
}

impl RequestReplace {
    /// Apply `config` to `request`, returning the change categories.
    pub fn apply(&self, request: &mut OutboundRequest, config: &RequestReplaceRule) -> Vec<String> {
        let mut actions = Vec::new();
        if let Some(headers) = &config.headers {
            replace_request_headers(request, headers);
            actions.push("headers".to_string());
        }
        if config.do_download && self.convert_download(request) {
            actions.push(format!("path:remove-{}", DOWNLOAD_MARKER));
        }
        actions
    }
}

/// Apply a header map to `request`.
///
/// [`REMOVE_MARKER`] deletes the header. Other values have their
/// placeholders substituted and replace the header; a value that is empty
/// after substitution removes the header and is never added.
pub fn replace_request_headers(request: &mut OutboundRequest, headers: &BTreeMap<String, String>) {
    for (name, value) in headers {
        let value = if value == REMOVE_MARKER {
            String::new()
        } else {
            replace_vars(value, request)
        };

        if value.is_empty() {
            if let Some(old) = request.headers.remove(name) {
                debug!("Header '{}' removed (was '{}')", name, old);
            }
            continue;
        }

        let old = request.headers.insert(name, value.clone());
        debug!(
            "Header '{}' replaced: '{}' -> '{}'",
            name,
            old.as_deref().unwrap_or(""),
            value
        );
    }
}

/// Substitute `${...}` placeholders in `template`.
///
/// Values come from the request's original snapshot, falling back to the
/// live request. Unknown placeholders are left untouched.
#[must_use]
pub fn replace_vars(template: &str, request: &OutboundRequest) -> String {
    if !template.contains("${") {
        return template.to_string();
    }
    let vars = Vars::of(request);

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match vars.get(key) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

struct Vars<'a> {
    hostname: &'a str,
    host: &'a str,
    method: &'a str,
    path: &'a str,
    protocol: String,
    port: u16,
    default_port: u16,
}

impl<'a> Vars<'a> {
    fn of(request: &'a OutboundRequest) -> Self {
        let original = request.original();
        let hostname = original.map_or(request.hostname.as_str(), |o| o.hostname.as_str());
        let host = original
            .and_then(|o| o.headers.get("host"))
            .or_else(|| request.headers.get("host"))
            .unwrap_or(hostname);
        let protocol = original.map_or(request.protocol, |o| o.protocol);
        Self {
            hostname,
            host,
            method: original.map_or(request.method.as_str(), |o| o.method.as_str()),
            path: original.map_or(request.path.as_str(), |o| o.path.as_str()),
            protocol: protocol.to_string(),
            port: original.map_or(request.port, |o| o.port),
            default_port: protocol.default_port(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "hostname" => self.hostname.to_string(),
            "host" => self.host.to_string(),
            "method" => self.method.to_string(),
            "path" => self.path.to_string(),
            "protocol" => self.protocol.clone(),
            "port" => self.port.to_string(),
            "url" => self.url(),
            _ => return None,
        };
        Some(value)
    }

    fn url(&self) -> String {
        let host = strip_port(self.host);
        if self.port == self.default_port {
            format!("{}//{}{}", self.protocol, host, self.path)
        } else {
            format!("{}//{}:{}{}", self.protocol, host, self.port, self.path)
        }
    }
}

/// `host` without a trailing `:port`; IPv6 literals keep their brackets.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
