use crate::{identity::NumericIdentity, options::IntOptions, policy::EndpointPolicy};
use anyhow::Result;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A snapshot of the endpoint fields the datapath needs, taken under the
/// endpoint lock and handed to collaborators after the lock is released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: u16,
    pub if_name: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub identity: NumericIdentity,
    pub options: IntOptions,
    pub at_host_ns: bool,
    pub policy_revision: u64,
}

/// Compiles, attaches and detaches endpoint programs.
#[async_trait::async_trait]
pub trait Orchestrator: Send + Sync {
    async fn reload_datapath(&self, ep: &EndpointInfo) -> Result<()>;

    async fn sync_policy_map(&self, ep: &EndpointInfo, policy: &EndpointPolicy) -> Result<()>;

    async fn unload(&self, ep: &EndpointInfo);
}

/// Host-level resources tied to an endpoint.
#[async_trait::async_trait]
pub trait HostDatapath: Send + Sync {
    async fn delete_routing_rules(&self, ep: &EndpointInfo) -> Result<()>;

    async fn remove_no_track_rules(&self, ep: &EndpointInfo, port: u16) -> Result<()>;

    async fn set_link_down(&self, if_name: &str) -> Result<()>;

    async fn delete_endpoint_maps(&self, endpoint_id: u16) -> Result<()>;

    async fn close_policy_map(&self, endpoint_id: u16) -> Result<()>;

    async fn scrub_conntrack(&self, ep: &EndpointInfo) -> Result<()>;
}
