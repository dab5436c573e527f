//! Response header sinks.
//!
//! Interceptors write response headers (such as their summary header) into
//! a [`HeaderSink`]. During the chain this is a [`NoopSink`] that only
//! records what was set. Headers the upstream did not send are appended to
//! the real response head before it is written to the client; upstream
//! headers are never altered.

/// Capability to set response headers.
pub trait HeaderSink: Send {
    /// Set `name` to `value`, replacing previous values.
    fn set_header(&mut self, name: &str, value: &str);

    /// First value of `name`, compared case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;
}

/// Sink that records headers without sending anything.
#[derive(Debug, Default, Clone)]
pub struct NoopSink {
    headers: Vec<(String, String)>,
}

impl NoopSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers set so far, in the order they were first set.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl HeaderSink for NoopSink {
    fn set_header(&mut self, name: &str, value: &str) {
        set_replacing(&mut self.headers, name, value);
    }

    fn header(&self, name: &str) -> Option<&str> {
        first_value(&self.headers, name)
    }
}

/// Parsed upstream response head.
///
/// Headers keep their original order, and a header repeated upstream stays
/// repeated, so `Set-Cookie` values are written one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Parse a complete head (status line through the blank line).
    pub fn parse(raw: &[u8]) -> crate::error::Result<Self> {
        // obs-text bytes in header values survive as replacement characters.
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default();

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(crate::error::ProxyError::HttpParse(format!(
                "malformed status line: {}",
                status_line
            )));
        }
        let status = crate::connect::parse_status_code(status_line)?;
        let reason = parts.nth(1).unwrap_or_default();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Ok(Self {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers,
        })
    }

    /// Every value of `name`, in order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append the sink's headers that the upstream did not send.
    ///
    /// Upstream headers stay as received, repeats included.
    pub fn merge(&mut self, sink: &NoopSink) {
        for (name, value) in sink.headers() {
            if self.header(name).is_none() {
                self.headers.push((name.to_string(), value.to_string()));
            }
        }
    }

    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.values("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Serialize for the client: status line, one line per header value,
    /// blank line.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

impl HeaderSink for ResponseHead {
    fn set_header(&mut self, name: &str, value: &str) {
        set_replacing(&mut self.headers, name, value);
    }

    fn header(&self, name: &str) -> Option<&str> {
        first_value(&self.headers, name)
    }
}

fn set_replacing(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(index) => {
            headers[index].1 = value.to_string();
            let mut seen = false;
            headers.retain(|(k, _)| {
                if !k.eq_ignore_ascii_case(name) {
                    return true;
                }
                let keep = !seen;
                seen = true;
                keep
            });
        }
        None => headers.push((name.to_string(), value.to_string())),
    }
}

fn first_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
