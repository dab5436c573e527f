//! Rule matching: which interceptors run for a request, and in which order.
//!
//! Rules are keyed by domain: an exact hostname, or `*.suffix` for every
//! subdomain of `suffix`. The host the client asked for is matched, not the
//! one a destination override redirected the request to. An exact rule wins over wildcards; among
//! wildcards the longest suffix wins. The interceptors applicable to the
//! chosen rule are ordered by priority, ties keeping registration order.

use crate::config::RuleConfig;
use crate::error::Result;
use crate::interceptor::{Interceptor, MatchedInterceptor, RequestReplace};
use crate::request::OutboundRequest;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Source of the ordered interceptor list for a request.
pub trait InterceptorMatcher: Send + Sync {
    fn match_interceptors(&self, request: &OutboundRequest) -> Vec<MatchedInterceptor>;
}

/// Interceptors shipped with the crate, in registration order.
pub fn default_interceptors() -> Result<Vec<Arc<dyn Interceptor>>> {
    Ok(vec![Arc::new(RequestReplace::new()?)])
}

/// Domain-keyed rule table plus the interceptor registry.
pub struct RuleMatcher {
    interceptors: Vec<Arc<dyn Interceptor>>,
    exact: BTreeMap<String, Arc<RuleConfig>>,
    /// `(suffix, rule)` sorted by descending suffix length.
    wildcard: Vec<(String, Arc<RuleConfig>)>,
}

impl RuleMatcher {
    pub fn new(
        interceptors: Vec<Arc<dyn Interceptor>>,
        rules: &BTreeMap<String, RuleConfig>,
    ) -> Self {
        let mut exact = BTreeMap::new();
        let mut wildcard = Vec::new();
        for (domain, rule) in rules {
            let domain = domain.to_ascii_lowercase();
            let rule = Arc::new(rule.clone());
            match domain.strip_prefix("*.") {
                Some(suffix) => wildcard.push((suffix.to_string(), rule)),
                None => {
                    exact.insert(domain, rule);
                }
            }
        }
        wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            interceptors,
            exact,
            wildcard,
        }
    }

    /// Rule configuration matching `hostname`, if any.
    #[must_use]
    pub fn rule_for(&self, hostname: &str) -> Option<Arc<RuleConfig>> {
        let host = hostname.to_ascii_lowercase();
        if let Some(rule) = self.exact.get(&host) {
            return Some(Arc::clone(rule));
        }
        self.wildcard
            .iter()
            .find(|(suffix, _)| {
                host.len() > suffix.len() + 1
                    && host.ends_with(suffix.as_str())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            })
            .map(|(_, rule)| Arc::clone(rule))
    }
}

impl InterceptorMatcher for RuleMatcher {
    fn match_interceptors(&self, request: &OutboundRequest) -> Vec<MatchedInterceptor> {
        let hostname = request
            .original()
            .map_or(request.hostname.as_str(), |original| original.hostname.as_str());
        let Some(rule) = self.rule_for(hostname) else {
            return Vec::new();
        };
        let mut matched: Vec<MatchedInterceptor> = self
            .interceptors
            .iter()
            .filter(|interceptor| interceptor.is_applicable(&rule))
            .map(|interceptor| MatchedInterceptor::new(Arc::clone(interceptor), Arc::clone(&rule)))
            .collect();
        // Stable: equal priorities keep registration order.
        matched.sort_by_key(|m| m.interceptor.priority());
        debug!(
            "Matched {} interceptor(s) for {}",
            matched.len(),
            hostname
        );
        matched
    }
}

impl std::fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleMatcher")
            .field(
                "interceptors",
                &self.interceptors.iter().map(|i| i.name()).collect::<Vec<_>>(),
            )
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field(
                "wildcard",
                &self.wildcard.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            )
            .finish()
    }
}
