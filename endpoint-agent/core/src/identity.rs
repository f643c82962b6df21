use crate::labels::{self, Labels, SOURCE_CIDR};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

mod allocator;

pub use self::allocator::{IdentityAllocator, LocalAllocator};

/// A cluster-wide numeric security identity.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct NumericIdentity(pub u32);

/// A numeric identity together with the label set it was allocated for.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identity {
    pub id: NumericIdentity,
    pub labels: Labels,
}

// === impl NumericIdentity ===

impl NumericIdentity {
    pub const UNKNOWN: Self = Self(0);
    pub const HOST: Self = Self(1);
    pub const WORLD: Self = Self(2);
    pub const UNMANAGED: Self = Self(3);
    pub const HEALTH: Self = Self(4);
    pub const INIT: Self = Self(5);
    pub const REMOTE_NODE: Self = Self(6);
    pub const KUBE_APISERVER: Self = Self(7);
    pub const INGRESS: Self = Self(8);

    /// Reserved identities live below this value.
    pub const MIN_ALLOCATED: Self = Self(256);

    pub fn is_reserved(&self) -> bool {
        self.0 > 0 && self.0 < Self::MIN_ALLOCATED.0
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    pub fn reserved_name(&self) -> Option<&'static str> {
        RESERVED
            .iter()
            .find(|(id, _)| id == self)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

const RESERVED: [(NumericIdentity, &str); 8] = [
    (NumericIdentity::HOST, labels::ID_NAME_HOST),
    (NumericIdentity::WORLD, labels::ID_NAME_WORLD),
    (NumericIdentity::UNMANAGED, labels::ID_NAME_UNMANAGED),
    (NumericIdentity::HEALTH, labels::ID_NAME_HEALTH),
    (NumericIdentity::INIT, labels::ID_NAME_INIT),
    (NumericIdentity::REMOTE_NODE, labels::ID_NAME_REMOTE_NODE),
    (NumericIdentity::KUBE_APISERVER, labels::ID_NAME_KUBE_APISERVER),
    (NumericIdentity::INGRESS, labels::ID_NAME_INGRESS),
];

// === impl Identity ===

impl Identity {
    pub fn new(id: NumericIdentity, labels: Labels) -> Self {
        Self { id, labels }
    }

    /// Returns the well-known identity for a reserved name, e.g. `init`.
    pub fn reserved(name: &str) -> Option<Arc<Self>> {
        RESERVED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(id, name)| Arc::new(Self::new(*id, Labels::reserved(name))))
    }

    pub fn init() -> Arc<Self> {
        Arc::new(Self::new(NumericIdentity::INIT, Labels::init()))
    }

    /// Maps a label set consisting of a single reserved label onto its
    /// well-known identity. Any set carrying `reserved:host` is the host
    /// identity, whatever node labels come with it.
    pub fn lookup_reserved(labels: &Labels) -> Option<Arc<Self>> {
        if labels.has_host_label() {
            return Some(Arc::new(Self::new(NumericIdentity::HOST, labels.clone())));
        }
        if labels.len() != 1 {
            return None;
        }
        let label = labels.iter().next()?;
        if !label.is_reserved() {
            return None;
        }
        Self::reserved(&label.key)
    }

    pub fn is_init(&self) -> bool {
        self.id == NumericIdentity::INIT
    }
}

/// Returns true when `labels` can be resolved without consulting the
/// cluster-wide store: either every label is reserved, or every label is a
/// parseable CIDR label.
pub fn allocation_is_local(labels: &Labels) -> bool {
    if labels.is_empty() {
        return false;
    }
    if labels.is_reserved() {
        return true;
    }
    labels
        .iter()
        .all(|l| l.source == SOURCE_CIDR && l.key.parse::<ipnet::IpNet>().is_ok())
}
