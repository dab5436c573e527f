//! In-memory doubles shared by the unit tests.

use crate::compat::{CompatDecision, CompatibilityStore};
use crate::error::ConnectError;
use crate::pool::{ConnectionPool, PoolHandle, SocketBinding};
use crate::request::OutboundRequest;
use crate::stream::BoxedIo;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;

type Handler = Arc<dyn Fn(DuplexStream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Pool whose connections are in-memory duplex pipes.
///
/// The far end of each pipe is either handed to a serving task or parked
/// so the near end stays open.
pub struct FakePool {
    verify: bool,
    unverified: Option<PoolHandle>,
    fail_self_signed: bool,
    handler: Option<Handler>,
    connects: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
    bindings: Mutex<HashMap<(u64, String), Arc<SocketBinding>>>,
}

impl FakePool {
    fn base(verify: bool) -> Self {
        Self {
            verify,
            unverified: None,
            fail_self_signed: false,
            handler: None,
            connects: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Verifying pool without an unverified sibling.
    pub fn verifying() -> Self {
        Self::base(true)
    }

    /// Verifying pool with an unverified sibling.
    pub fn with_unverified_variant() -> Self {
        let mut pool = Self::base(true);
        pool.unverified = Some(Arc::new(Self::base(false)));
        pool
    }

    /// Pool whose every connection is answered by `serve`.
    pub fn serving<F, Fut>(serve: F) -> Self
    where
        F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pool = Self::base(true);
        let handler: Handler = Arc::new(
            move |peer| -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(serve(peer)) },
        );
        pool.handler = Some(handler);
        pool
    }

    /// Verifying pool that fails with a self-signed certificate error; its
    /// unverified sibling is answered by `serve`.
    pub fn self_signed<F, Fut>(serve: F) -> Self
    where
        F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut sibling = Self::serving(serve);
        sibling.verify = false;
        let mut pool = Self::base(true);
        pool.fail_self_signed = true;
        pool.unverified = Some(Arc::new(sibling));
        pool
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for FakePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakePool")
            .field("verify", &self.verify)
            .field("connects", &self.connect_count())
            .finish()
    }
}

#[async_trait]
impl ConnectionPool for FakePool {
    fn verifies_certificates(&self) -> bool {
        self.verify
    }

    fn unverified_variant(&self) -> Option<PoolHandle> {
        self.unverified.clone()
    }

    fn binding(&self, socket_id: u64, name: &str) -> Option<Arc<SocketBinding>> {
        let mut bindings = self.bindings.lock();
        Some(Arc::clone(
            bindings.entry((socket_id, name.to_string())).or_default(),
        ))
    }

    fn evict_bindings(&self, socket_id: u64) -> usize {
        let mut bindings = self.bindings.lock();
        let before = bindings.len();
        bindings.retain(|(id, _), _| *id != socket_id);
        before - bindings.len()
    }

    async fn connect(&self, request: &OutboundRequest) -> Result<BoxedIo, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_self_signed {
            return Err(ConnectError::SelfSignedCertificate {
                host: request.hostname.clone(),
            });
        }
        let (near, far) = tokio::io::duplex(64 * 1024);
        match &self.handler {
            Some(handler) => {
                tokio::spawn(handler(far));
            }
            None => self.peers.lock().push(far),
        }
        Ok(Box::new(near))
    }
}

/// Compatibility store that records every call.
#[derive(Default)]
pub struct CountingCompatStore {
    decisions: Mutex<HashMap<String, bool>>,
    lookups: AtomicUsize,
    updates: Mutex<Vec<(String, bool)>>,
}

impl CountingCompatStore {
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(String, bool)> {
        self.updates.lock().clone()
    }
}

impl CompatibilityStore for CountingCompatStore {
    fn decision(&self, request: &OutboundRequest) -> Option<CompatDecision> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.decisions
            .lock()
            .get(&request.destination())
            .map(|verify| CompatDecision {
                verify_certificates: *verify,
            })
    }

    fn set_decision(&self, request: &OutboundRequest, verify_certificates: bool) {
        let destination = request.destination();
        self.decisions
            .lock()
            .insert(destination.clone(), verify_certificates);
        self.updates.lock().push((destination, verify_certificates));
    }
}
