use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, net::IpAddr, str::FromStr};

/// Allowed DNS name patterns, per proxied port and protocol.
pub type DnsRules = BTreeMap<PortProto, Vec<String>>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortProto {
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid port/protocol {0:?}")]
pub struct InvalidPortProto(String);

/// Observed DNS lookups that must survive an agent restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsHistory {
    #[serde(default)]
    pub lookups: Vec<DnsLookup>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsLookup {
    pub name: String,
    pub ips: Vec<IpAddr>,
    pub expires_at: DateTime<Utc>,
}

/// IPs whose DNS lookups have expired but which may still carry connections.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsZombies {
    #[serde(default)]
    pub zombies: Vec<DnsZombie>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsZombie {
    pub ip: IpAddr,
    pub names: Vec<String>,
    pub alive_at: DateTime<Utc>,
}

/// The DNS proxy's rule storage.
///
/// Implementations must not call back into endpoints while serving
/// `get_dns_rules`.
pub trait DnsRulesApi: Send + Sync {
    fn get_dns_rules(&self, endpoint_id: u16) -> DnsRules;

    fn remove_restored_dns_rules(&self, endpoint_id: u16);
}

/// An in-process rule store. Rules restored from disk are kept apart from
/// rules installed since startup.
#[derive(Debug, Default)]
pub struct InMemoryDnsRules {
    inner: RwLock<RulesIndex>,
}

#[derive(Debug, Default)]
struct RulesIndex {
    current: HashMap<u16, DnsRules>,
    restored: HashMap<u16, DnsRules>,
}

// === impl PortProto ===

impl PortProto {
    pub fn new(port: u16, protocol: impl Into<String>) -> Self {
        Self {
            port,
            protocol: protocol.into(),
        }
    }
}

impl fmt::Display for PortProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortProto {
    type Err = InvalidPortProto;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = s
            .split_once('/')
            .ok_or_else(|| InvalidPortProto(s.to_string()))?;
        let port = port.parse().map_err(|_| InvalidPortProto(s.to_string()))?;
        if protocol.is_empty() {
            return Err(InvalidPortProto(s.to_string()));
        }
        Ok(Self::new(port, protocol))
    }
}

impl TryFrom<String> for PortProto {
    type Error = InvalidPortProto;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortProto> for String {
    fn from(pp: PortProto) -> Self {
        pp.to_string()
    }
}

// === impl InMemoryDnsRules ===

impl InMemoryDnsRules {
    pub fn set_rules(&self, endpoint_id: u16, rules: DnsRules) {
        self.inner.write().current.insert(endpoint_id, rules);
    }

    pub fn restore_rules(&self, endpoint_id: u16, rules: DnsRules) {
        if rules.is_empty() {
            return;
        }
        self.inner.write().restored.insert(endpoint_id, rules);
    }

    pub fn has_restored(&self, endpoint_id: u16) -> bool {
        self.inner.read().restored.contains_key(&endpoint_id)
    }
}

impl DnsRulesApi for InMemoryDnsRules {
    fn get_dns_rules(&self, endpoint_id: u16) -> DnsRules {
        let index = self.inner.read();
        index
            .current
            .get(&endpoint_id)
            .or_else(|| index.restored.get(&endpoint_id))
            .cloned()
            .unwrap_or_default()
    }

    fn remove_restored_dns_rules(&self, endpoint_id: u16) {
        self.inner.write().restored.remove(&endpoint_id);
    }
}
