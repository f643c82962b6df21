use anyhow::Result;
use endpoint_agent_core::{
    datapath::{EndpointInfo, HostDatapath, Orchestrator},
    policy::{EndpointPolicy, Redirect, RedirectKey},
    proxy::{EndpointProxy, RedirectUpdate},
};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU16, Ordering},
};
use tracing::debug;

/// A datapath and proxy that only log what they would have done.
#[derive(Debug)]
pub struct NoopDatapath {
    next_proxy_port: AtomicU16,
}

impl Default for NoopDatapath {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PROXY_PORT_BASE)
    }
}

impl NoopDatapath {
    const DEFAULT_PROXY_PORT_BASE: u16 = 10_000;

    pub fn new(proxy_port_base: u16) -> Self {
        Self {
            next_proxy_port: AtomicU16::new(proxy_port_base),
        }
    }
}

#[async_trait::async_trait]
impl Orchestrator for NoopDatapath {
    async fn reload_datapath(&self, ep: &EndpointInfo) -> Result<()> {
        debug!(endpoint.id = ep.id, identity = %ep.identity, "Reloading datapath");
        Ok(())
    }

    async fn sync_policy_map(&self, ep: &EndpointInfo, policy: &EndpointPolicy) -> Result<()> {
        debug!(endpoint.id = ep.id, revision = policy.revision, "Syncing policy map");
        Ok(())
    }

    async fn unload(&self, ep: &EndpointInfo) {
        debug!(endpoint.id = ep.id, "Unloading datapath");
    }
}

#[async_trait::async_trait]
impl HostDatapath for NoopDatapath {
    async fn delete_routing_rules(&self, ep: &EndpointInfo) -> Result<()> {
        debug!(endpoint.id = ep.id, ipv4 = ?ep.ipv4, ipv6 = ?ep.ipv6, "Deleting routing rules");
        Ok(())
    }

    async fn remove_no_track_rules(&self, ep: &EndpointInfo, port: u16) -> Result<()> {
        debug!(endpoint.id = ep.id, port, "Removing no-track rules");
        Ok(())
    }

    async fn set_link_down(&self, if_name: &str) -> Result<()> {
        debug!(%if_name, "Setting link down");
        Ok(())
    }

    async fn delete_endpoint_maps(&self, endpoint_id: u16) -> Result<()> {
        debug!(endpoint.id = endpoint_id, "Deleting endpoint maps");
        Ok(())
    }

    async fn close_policy_map(&self, endpoint_id: u16) -> Result<()> {
        debug!(endpoint.id = endpoint_id, "Closing policy map");
        Ok(())
    }

    async fn scrub_conntrack(&self, ep: &EndpointInfo) -> Result<()> {
        debug!(endpoint.id = ep.id, "Scrubbing conntrack entries");
        Ok(())
    }
}

#[async_trait::async_trait]
impl EndpointProxy for NoopDatapath {
    async fn update_redirects(
        &self,
        endpoint_id: u16,
        policy: &EndpointPolicy,
    ) -> Result<RedirectUpdate> {
        let ports = policy
            .redirects
            .keys()
            .map(|key| {
                let port = self.next_proxy_port.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint.id = endpoint_id, %key, proxy_port = port, "Adding redirect");
                (key.clone(), port)
            })
            .collect();
        Ok(RedirectUpdate {
            ports,
            completions: Vec::new(),
        })
    }

    async fn remove_redirects(&self, endpoint_id: u16, redirects: &BTreeMap<RedirectKey, Redirect>) {
        for key in redirects.keys() {
            debug!(endpoint.id = endpoint_id, %key, "Removing redirect");
        }
    }
}
