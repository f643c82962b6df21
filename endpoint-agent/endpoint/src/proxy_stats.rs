use crate::Endpoint;
use endpoint_agent_core::policy::RedirectKey;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

pub(crate) type ProxyStatsIndex = BTreeMap<String, ProxyStatistics>;

/// Counters for one proxied listener of an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatistics {
    pub location: String,
    pub protocol: String,
    pub port: u16,
    pub allocated_proxy_port: u16,
    pub requests: MessageStatistics,
    pub responses: MessageStatistics,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MessageStatistics {
    pub received: u64,
    pub forwarded: u64,
    pub denied: u64,
    pub error: u64,
}

/// The proxy's decision about a single message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Forwarded,
    Denied,
    Error,
}

fn stats_key(ingress: bool, protocol: &str, port: u16, proxy_port: u16) -> String {
    let direction = if ingress { "ingress" } else { "egress" };
    format!("{direction}:{protocol}:{port}:{proxy_port}")
}

impl Endpoint {
    /// Returns the statistics entry for a redirect, creating it if needed.
    pub fn proxy_statistics(
        &self,
        key: &RedirectKey,
        l7_protocol: &str,
        proxy_port: u16,
    ) -> ProxyStatistics {
        let mut index = self.proxy_stats.lock();
        let stats = index
            .entry(stats_key(key.ingress, &key.protocol, key.port, proxy_port))
            .or_insert_with(|| ProxyStatistics {
                location: key.direction().to_string(),
                protocol: l7_protocol.to_string(),
                port: key.port,
                ..Default::default()
            });
        stats.allocated_proxy_port = proxy_port;
        stats.clone()
    }

    /// Records a proxied message.
    #[allow(clippy::too_many_arguments)]
    pub fn update_proxy_statistics(
        &self,
        proxy_type: &str,
        l4_protocol: &str,
        port: u16,
        proxy_port: u16,
        ingress: bool,
        request: bool,
        verdict: Verdict,
    ) {
        let key = stats_key(ingress, l4_protocol, port, proxy_port);
        let mut index = self.proxy_stats.lock();
        let Some(stats) = index.get_mut(&key) else {
            debug!(endpoint.id = self.id, %key, "Proxy stats not found when updating");
            return;
        };

        let msgs = if request {
            &mut stats.requests
        } else {
            &mut stats.responses
        };
        msgs.received += 1;
        let metrics = &self.deps.metrics;
        metrics.proxy_l7("received", proxy_type);
        match verdict {
            Verdict::Forwarded => {
                msgs.forwarded += 1;
                metrics.proxy_l7("forwarded", proxy_type);
            }
            Verdict::Denied => {
                msgs.denied += 1;
                metrics.proxy_l7("denied", proxy_type);
            }
            Verdict::Error => {
                msgs.error += 1;
                metrics.proxy_l7("parse_errors", proxy_type);
            }
        }
    }

    /// Copies of every entry, ordered by key.
    pub fn proxy_statistics_snapshot(&self) -> Vec<ProxyStatistics> {
        self.proxy_stats.lock().values().cloned().collect()
    }
}
