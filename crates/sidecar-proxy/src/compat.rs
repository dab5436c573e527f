//! Certificate-verification compatibility decisions.
//!
//! The store remembers, per `host:port`, whether certificates should be
//! verified. Before connecting, a request whose pool disagrees with the
//! stored decision is switched to the pool's unverified variant. After a
//! self-signed certificate failure the destination is recorded as
//! "do not verify" so later requests heal themselves.

use crate::audit;
use crate::config::AutoHealPolicy;
use crate::error::ConnectError;
use crate::request::OutboundRequest;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::debug;

/// Stored decision for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatDecision {
    pub verify_certificates: bool,
}

/// Lookup and update contract of the compatibility store.
pub trait CompatibilityStore: Send + Sync {
    fn decision(&self, request: &OutboundRequest) -> Option<CompatDecision>;

    fn set_decision(&self, request: &OutboundRequest, verify_certificates: bool);
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    decision: CompatDecision,
    /// `None` for seeded entries, which never expire.
    recorded: Option<Instant>,
}

/// In-memory compatibility store.
#[derive(Debug)]
pub struct MemoryCompatStore {
    entries: RwLock<HashMap<String, Entry>>,
    policy: AutoHealPolicy,
}

impl MemoryCompatStore {
    #[must_use]
    pub fn new(policy: AutoHealPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Store seeded with configured decisions keyed by `host:port`.
    #[must_use]
    pub fn with_seed(policy: AutoHealPolicy, seed: &BTreeMap<String, CompatDecision>) -> Self {
        let entries = seed
            .iter()
            .map(|(destination, decision)| {
                (
                    destination.to_ascii_lowercase(),
                    Entry {
                        decision: *decision,
                        recorded: None,
                    },
                )
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
            policy,
        }
    }

    /// Forget the decision for a destination.
    pub fn reset(&self, destination: &str) -> bool {
        self.entries
            .write()
            .remove(&destination.to_ascii_lowercase())
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CompatibilityStore for MemoryCompatStore {
    fn decision(&self, request: &OutboundRequest) -> Option<CompatDecision> {
        let key = request.destination().to_ascii_lowercase();
        let entry = *self.entries.read().get(&key)?;
        if let (Some(recorded), Some(ttl)) = (entry.recorded, self.policy.expire_after()) {
            if recorded.elapsed() >= ttl {
                debug!("Compatibility decision for {} expired", key);
                self.entries.write().remove(&key);
                return None;
            }
        }
        Some(entry.decision)
    }

    fn set_decision(&self, request: &OutboundRequest, verify_certificates: bool) {
        self.entries.write().insert(
            request.destination().to_ascii_lowercase(),
            Entry {
                decision: CompatDecision {
                    verify_certificates,
                },
                recorded: Some(Instant::now()),
            },
        );
    }
}

/// Switch `request` to its pool's unverified variant when the store says
/// this destination must not be verified.
///
/// Only applies to requests that carry a pool handle. Returns whether the
/// pool was swapped.
pub fn apply_tls_override(request: &mut OutboundRequest, store: &dyn CompatibilityStore) -> bool {
    let Some(agent) = request.agent.as_ref() else {
        return false;
    };
    let Some(decision) = store.decision(request) else {
        return false;
    };
    if decision.verify_certificates == agent.verifies_certificates() {
        return false;
    }
    if decision.verify_certificates {
        debug!(
            "Compatibility store asks to verify {} but the pool does not",
            request.destination()
        );
        return false;
    }
    match agent.unverified_variant() {
        Some(unverified) => {
            audit::log_verification_override(&request.destination(), false);
            request.agent = Some(unverified);
            true
        }
        None => false,
    }
}

/// Record the auto-heal downgrade if `err` is a self-signed certificate
/// failure. Returns whether the store was updated.
pub fn record_connect_failure(
    request: &OutboundRequest,
    err: &ConnectError,
    store: &dyn CompatibilityStore,
    policy: &AutoHealPolicy,
) -> bool {
    if !policy.enabled || !err.is_self_signed() {
        return false;
    }
    store.set_decision(request, false);
    audit::log_compat_downgrade(&request.destination());
    true
}
