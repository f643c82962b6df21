use crate::identity::{Identity, NumericIdentity};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// The policy computed for a single endpoint at a given repository revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointPolicy {
    pub revision: u64,
    pub identity: NumericIdentity,
    pub ingress: PeerSelection,
    pub egress: PeerSelection,
    pub redirects: BTreeMap<RedirectKey, Redirect>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerSelection {
    All,
    Identities(BTreeSet<NumericIdentity>),
}

/// Identifies a listener that must be redirected to the L7 proxy.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct RedirectKey {
    pub ingress: bool,
    pub protocol: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub l7_protocol: String,
    pub proxy_type: String,
}

/// Computes desired policy for endpoints.
pub trait PolicyRepository: Send + Sync {
    /// The current repository revision. Monotonic.
    fn revision(&self) -> u64;

    fn compute_policy(&self, endpoint_id: u16, identity: &Identity) -> Result<Arc<EndpointPolicy>>;

    /// Removes references to `policy` from shared policy state.
    fn detach(&self, endpoint_id: u16, policy: &EndpointPolicy);
}

/// A repository that allows all traffic and carries only a revision counter.
#[derive(Debug)]
pub struct StaticPolicyRepository {
    revision: AtomicU64,
}

// === impl EndpointPolicy ===

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self::empty(NumericIdentity::UNKNOWN)
    }
}

impl EndpointPolicy {
    /// The policy an endpoint holds before its first computation.
    pub fn empty(identity: NumericIdentity) -> Self {
        Self {
            revision: 0,
            identity,
            ingress: PeerSelection::Identities(BTreeSet::new()),
            egress: PeerSelection::Identities(BTreeSet::new()),
            redirects: BTreeMap::new(),
        }
    }

    pub fn allow_all(revision: u64, identity: NumericIdentity) -> Self {
        Self {
            revision,
            identity,
            ingress: PeerSelection::All,
            egress: PeerSelection::All,
            redirects: BTreeMap::new(),
        }
    }

    pub fn allows_ingress(&self, peer: NumericIdentity) -> bool {
        self.ingress.contains(peer)
    }
}

// === impl PeerSelection ===

impl PeerSelection {
    pub fn contains(&self, peer: NumericIdentity) -> bool {
        match self {
            Self::All => true,
            Self::Identities(ids) => ids.contains(&peer),
        }
    }
}

// === impl RedirectKey ===

impl RedirectKey {
    pub fn direction(&self) -> &'static str {
        if self.ingress {
            "ingress"
        } else {
            "egress"
        }
    }
}

impl fmt::Display for RedirectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.direction(), self.protocol, self.port)
    }
}

// === impl StaticPolicyRepository ===

impl Default for StaticPolicyRepository {
    fn default() -> Self {
        Self {
            revision: AtomicU64::new(1),
        }
    }
}

impl StaticPolicyRepository {
    /// Bumps the repository revision, returning the new value.
    pub fn bump_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl PolicyRepository for StaticPolicyRepository {
    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn compute_policy(&self, _endpoint_id: u16, identity: &Identity) -> Result<Arc<EndpointPolicy>> {
        Ok(Arc::new(EndpointPolicy::allow_all(self.revision(), identity.id)))
    }

    fn detach(&self, _endpoint_id: u16, _policy: &EndpointPolicy) {}
}
