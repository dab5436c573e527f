use super::{Flow, MatchedInterceptor};
use crate::audit;
use crate::context::RequestContext;
use crate::error::{ProxyError, Result};
use crate::sink::HeaderSink;
use tracing::{debug, Instrument};

/// How a chain run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every interceptor let the request continue.
    Completed,
    /// The named interceptor handled the request and stopped the chain.
    Halted(String),
}

/// Ordered interceptors for one request.
///
/// The order is the one the matcher delivered; the chain never re-sorts.
#[derive(Debug, Default)]
pub struct InterceptorChain {
    interceptors: Vec<MatchedInterceptor>,
}

impl InterceptorChain {
    #[must_use]
    pub fn new(interceptors: Vec<MatchedInterceptor>) -> Self {
        Self { interceptors }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the interceptors one after another.
    ///
    /// A hook error aborts the chain and is returned wrapped with the
    /// interceptor's name.
    pub async fn run(
        &self,
        ctx: &mut RequestContext,
        sink: &mut dyn HeaderSink,
    ) -> Result<ChainOutcome> {
        for matched in &self.interceptors {
            let name = matched.interceptor.name();
            let span = ctx.span.clone();
            debug!(parent: &span, "Running interceptor {}", name);

            let flow = matched
                .interceptor
                .intercept(ctx, &matched.rule, sink)
                .instrument(span)
                .await;

            match flow {
                Ok(Flow::Next) => {}
                Ok(Flow::Halt) => {
                    audit::log_chain_halted(name, &ctx.request.display_url());
                    return Ok(ChainOutcome::Halted(name.to_string()));
                }
                Err(e) => {
                    audit::log_chain_failed(name, &ctx.request.display_url(), &e.to_string());
                    return Err(ProxyError::interceptor(name, e));
                }
            }
        }
        Ok(ChainOutcome::Completed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{ProxySettings, RuleConfig};
    use crate::context::RequestCounter;
    use crate::interceptor::Interceptor;
    use crate::request::{OutboundRequest, Protocol};
    use crate::sink::NoopSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Appends its name to a shared log, then returns the configured flow.
    struct Recording {
        name: &'static str,
        flow: Option<Flow>,
        log: CallLog,
    }

    #[async_trait]
    impl Interceptor for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            0
        }

        fn is_applicable(&self, _rule: &RuleConfig) -> bool {
            true
        }

        async fn intercept(
            &self,
            ctx: &mut RequestContext,
            _rule: &RuleConfig,
            sink: &mut dyn HeaderSink,
        ) -> Result<Flow> {
            self.log.lock().push(self.name);
            ctx.request.headers.insert(&format!("x-{}", self.name), "seen");
            sink.set_header("X-Last", self.name);
            self.flow
                .ok_or_else(|| ProxyError::InvalidRequest(format!("{} failed", self.name)))
        }
    }

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    fn chain_of(steps: &[(&'static str, Option<Flow>)]) -> (InterceptorChain, CallLog) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rule = Arc::new(RuleConfig::default());
        let interceptors = steps
            .iter()
            .map(|(name, flow)| {
                let interceptor: Arc<dyn Interceptor> = Arc::new(Recording {
                    name: *name,
                    flow: *flow,
                    log: Arc::clone(&log),
                });
                MatchedInterceptor::new(interceptor, Arc::clone(&rule))
            })
            .collect();
        (InterceptorChain::new(interceptors), log)
    }

    fn context() -> RequestContext {
        let request = OutboundRequest::new("GET", Protocol::Https, "a.com", 443, "/").unwrap();
        RequestContext::new(
            request,
            Arc::new(RequestCounter::default()),
            Arc::new(ProxySettings::default()),
        )
    }

    #[tokio::test]
    async fn test_halting_hook_stops_chain() {
        let (chain, log) = chain_of(&[
            ("first", Some(Flow::Next)),
            ("second", Some(Flow::Halt)),
            ("third", Some(Flow::Next)),
        ]);
        let mut ctx = context();
        let mut sink = NoopSink::new();

        let outcome = chain.run(&mut ctx, &mut sink).await.unwrap();
        assert_eq!(outcome, ChainOutcome::Halted("second".to_string()));
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert!(ctx.request.headers.contains("x-first"));
        assert!(ctx.request.headers.contains("x-second"));
        assert!(!ctx.request.headers.contains("x-third"));
        assert_eq!(sink.header("x-last"), Some("second"));
    }

    #[tokio::test]
    async fn test_runs_in_delivered_order() {
        let (chain, log) = chain_of(&[("b", Some(Flow::Next)), ("a", Some(Flow::Next))]);
        let mut ctx = context();
        let outcome = chain.run(&mut ctx, &mut NoopSink::new()).await.unwrap();
        assert_eq!(outcome, ChainOutcome::Completed);
        assert_eq!(*log.lock(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_failure_aborts_and_names_interceptor() {
        let (chain, log) = chain_of(&[
            ("first", Some(Flow::Next)),
            ("broken", None),
            ("third", Some(Flow::Next)),
        ]);
        let mut ctx = context();
        let err = chain.run(&mut ctx, &mut NoopSink::new()).await.unwrap_err();
        match err {
            ProxyError::Interceptor { interceptor, .. } => assert_eq!(interceptor, "broken"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*log.lock(), vec!["first", "broken"]);
    }

    #[tokio::test]
    async fn test_empty_chain_completes() {
        let chain = InterceptorChain::default();
        assert!(chain.is_empty());
        let mut ctx = context();
        let outcome = chain.run(&mut ctx, &mut NoopSink::new()).await.unwrap();
        assert_eq!(outcome, ChainOutcome::Completed);
    }
}
