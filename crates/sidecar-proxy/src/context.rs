//! Per-request context handed to interceptors.

use crate::config::ProxySettings;
use crate::request::OutboundRequest;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide request counters.
#[derive(Debug, Default)]
pub struct RequestCounter {
    requests: AtomicU64,
    relayed: AtomicU64,
    upgraded: AtomicU64,
    halted: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`RequestCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub relayed: u64,
    pub upgraded: u64,
    pub halted: u64,
    pub failed: u64,
}

impl RequestCounter {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgraded(&self) {
        self.upgraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_halted(&self) {
        self.halted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            upgraded: self.upgraded.load(Ordering::Relaxed),
            halted: self.halted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Everything an interceptor may read or change for one request.
///
/// Owned by the task serving the request. The span carries the request URL
/// and id, so interceptor log lines are attributed to their request.
#[derive(Debug)]
pub struct RequestContext {
    pub request: OutboundRequest,
    pub span: tracing::Span,
    pub counter: Arc<RequestCounter>,
    pub settings: Arc<ProxySettings>,
}

impl RequestContext {
    pub fn new(
        request: OutboundRequest,
        counter: Arc<RequestCounter>,
        settings: Arc<ProxySettings>,
    ) -> Self {
        let span = tracing::debug_span!(
            "request",
            url = %request.display_url(),
            socket_id = request.custom_socket_id,
        );
        Self {
            request,
            span,
            counter,
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_snapshot() {
        let counter = RequestCounter::default();
        counter.record_request();
        counter.record_request();
        counter.record_upgraded();
        counter.record_failed();
        assert_eq!(
            counter.snapshot(),
            CounterSnapshot {
                requests: 2,
                upgraded: 1,
                failed: 1,
                ..Default::default()
            }
        );
    }
}
