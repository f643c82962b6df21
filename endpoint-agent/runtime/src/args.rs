use crate::{Agent, GoDuration, NoopDatapath};
use anyhow::{bail, Result};
use clap::Parser;
use endpoint_agent_core::{
    dns::InMemoryDnsRules, labels::Labels, metadata::MetadataResolver,
    policy::StaticPolicyRepository, LocalAllocator,
};
use endpoint_agent_endpoint::{EndpointConfig, EndpointDeps, EndpointMetrics};
use endpoint_agent_k8s::{node_labels, KubeMetadataResolver, LabelFilter};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[clap(name = "endpoint-agent", about = "Manages the network endpoints of a node")]
pub struct Args {
    #[clap(long, default_value = "endpoint_agent=info,warn", env = "ENDPOINT_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Directory holding the persisted state of each endpoint.
    #[clap(long, default_value = "/var/run/endpoint-agent/state")]
    state_dir: PathBuf,

    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    /// Interface of the host endpoint.
    #[clap(long, default_value = "agent_host")]
    host_interface: String,

    /// First numeric identity handed out by the node-local allocator.
    #[clap(long, default_value = "256")]
    identity_allocation_base: u32,

    /// Keep option values of restored endpoints instead of resetting them.
    #[clap(long)]
    keep_config: bool,

    #[clap(long)]
    manage_routing_rules: bool,

    #[clap(long, default_value = "5s", env = "ENDPOINT_AGENT_IDENTITY_CHANGE_GRACE_PERIOD")]
    identity_change_grace_period: GoDuration,

    #[clap(long, default_value = "5m", env = "ENDPOINT_AGENT_IDENTITY_RESOLVE_INTERVAL")]
    identity_resolve_interval: GoDuration,

    #[clap(long, default_value = "5s", env = "ENDPOINT_AGENT_DNS_SYNC_MIN_INTERVAL")]
    dns_sync_min_interval: GoDuration,

    #[clap(long, default_value = "330s", env = "ENDPOINT_AGENT_REGENERATION_TIMEOUT")]
    regeneration_timeout: GoDuration,

    /// Bounds the wait for proxy acknowledgements during a regeneration.
    /// Unbounded other than by the regeneration timeout when unset.
    #[clap(long, env = "ENDPOINT_AGENT_PROXY_WAIT_TIMEOUT")]
    proxy_wait_timeout: Option<GoDuration>,

    #[clap(long, default_value = "10s", env = "ENDPOINT_AGENT_REGENERATION_RECOVERY_INTERVAL")]
    regeneration_recovery_interval: GoDuration,

    #[clap(long, default_value = "1s", env = "ENDPOINT_AGENT_STATE_CHANGE_POLL_INTERVAL")]
    state_change_poll_interval: GoDuration,

    #[clap(long, default_value = "30s", env = "ENDPOINT_AGENT_STATE_CHANGE_TIMEOUT")]
    state_change_timeout: GoDuration,

    #[clap(long, default_value = "30s", env = "ENDPOINT_AGENT_LAUNCH_TIME")]
    launch_time: GoDuration,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let config = Arc::new(self.endpoint_config());
        let Self {
            admin,
            client,
            log_level,
            log_format,
            node_name,
            host_interface,
            identity_allocation_base,
            ..
        } = self;

        let mut prom = <Registry>::default();
        let metrics = EndpointMetrics::register(prom.sub_registry_with_prefix("endpoint"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let dry_run = Arc::new(NoopDatapath::default());
        let dns = Arc::new(InMemoryDnsRules::default());
        let deps = EndpointDeps {
            allocator: Arc::new(LocalAllocator::new(
                identity_allocation_base,
                u16::MAX as u32,
            )),
            policy: Arc::new(StaticPolicyRepository::default()),
            orchestrator: dry_run.clone(),
            datapath: dry_run.clone(),
            proxy: dry_run,
            dns: dns.clone(),
            metrics,
        };
        let agent = Agent::new(deps, dns, config);

        let resolver: Arc<dyn MetadataResolver> =
            Arc::new(KubeMetadataResolver::new(runtime.client()));
        agent.restore(resolver).await?;

        let node = match node_labels(runtime.client(), &node_name, &LabelFilter::default()).await {
            Ok(labels) => labels,
            Err(error) => {
                warn!(%node_name, "{error:#}");
                Labels::new()
            }
        };
        let host = agent.ensure_host(&host_interface, &node).await?;
        info!(endpoint.id = host.id(), %node_name, "Endpoint agent started");

        let res = runtime.run().await;
        agent.close().await;
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            identity_change_grace_period: self.identity_change_grace_period.into(),
            identity_resolve_interval: self.identity_resolve_interval.into(),
            dns_sync_min_interval: self.dns_sync_min_interval.into(),
            regeneration_timeout: self.regeneration_timeout.into(),
            proxy_wait_timeout: self.proxy_wait_timeout.map(Into::into),
            regeneration_recovery_interval: self.regeneration_recovery_interval.into(),
            state_change_poll_interval: self.state_change_poll_interval.into(),
            state_change_timeout: self.state_change_timeout.into(),
            launch_time: self.launch_time.into(),
            state_dir: self.state_dir.clone(),
            keep_config: self.keep_config,
            manage_routing_rules: self.manage_routing_rules,
            ..Default::default()
        }
    }
}
