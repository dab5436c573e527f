//! Interceptor contract and the chain that runs interceptors in order.
//!
//! An interceptor is a named hook with a priority and an applicability
//! predicate over the matched rule configuration. The hook may change the
//! outbound request and either let the chain continue ([`Flow::Next`]) or
//! stop it ([`Flow::Halt`]) after answering the request itself.

mod chain;
mod request_replace;

pub use chain::{ChainOutcome, InterceptorChain};
pub use request_replace::{
    replace_request_headers, replace_vars, RequestReplace, DOWNLOAD_MARKER, REMOVE_MARKER,
    SUMMARY_HEADER,
};

use crate::config::RuleConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::sink::HeaderSink;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// What the chain does after a hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next interceptor.
    Next,
    /// The hook handled the request; run nothing else.
    Halt,
}

/// A request interceptor.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    /// Whether this interceptor applies to a request matched by `rule`.
    fn is_applicable(&self, rule: &RuleConfig) -> bool;

    async fn intercept(
        &self,
        ctx: &mut RequestContext,
        rule: &RuleConfig,
        sink: &mut dyn HeaderSink,
    ) -> Result<Flow>;
}

/// An interceptor paired with the rule configuration it matched.
#[derive(Clone)]
pub struct MatchedInterceptor {
    pub interceptor: Arc<dyn Interceptor>,
    pub rule: Arc<RuleConfig>,
}

impl MatchedInterceptor {
    pub fn new(interceptor: Arc<dyn Interceptor>, rule: Arc<RuleConfig>) -> Self {
        Self { interceptor, rule }
    }
}

impl fmt::Debug for MatchedInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchedInterceptor")
            .field("name", &self.interceptor.name())
            .field("priority", &self.interceptor.priority())
            .finish()
    }
}
