#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod controller;
mod delete;
mod dns_sync;
mod error;
mod identity;
mod kind;
mod labels;
mod lock;
mod metadata;
mod metrics;
mod persist;
mod proxy_stats;
mod regeneration;
mod revision;
mod state;
mod status;
mod update;

#[cfg(test)]
mod tests;

pub use self::{
    config::EndpointConfig,
    delete::DeleteConfig,
    error::{DeleteErrors, Error},
    kind::{EndpointKind, Properties},
    metrics::EndpointMetrics,
    persist::{
        filter_endpoint_dirs, select_restore_dirs, SerializedEndpoint, ENDPOINT_CONFIG_FILE,
    },
    proxy_stats::{MessageStatistics, ProxyStatistics, Verdict},
    revision::{DoneFn, PolicyRevisionWait},
    state::{State, ALL_STATES},
    status::{StatusCode, StatusEntry, StatusLog, StatusType, MAX_LOGS},
};

use self::{
    controller::Controllers, dns_sync::Trigger, proxy_stats::ProxyStatsIndex,
    revision::PolicySignal,
};
use ahash::AHashMap as HashMap;
use endpoint_agent_core::{
    datapath::{EndpointInfo, HostDatapath, Orchestrator},
    dns::{DnsHistory, DnsRules, DnsRulesApi, DnsZombies},
    identity::{Identity, IdentityAllocator, NumericIdentity},
    labels::Labels,
    metadata::{ContainerPort, PodInfo},
    options::IntOptions,
    policy::{EndpointPolicy, PolicyRepository},
    proxy::EndpointProxy,
    OpLabels,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, Ipv6Addr},
    sync::{Arc, Weak},
};
use tokio_util::sync::CancellationToken;

/// The collaborators an endpoint calls into.
#[derive(Clone)]
pub struct EndpointDeps {
    pub allocator: Arc<dyn IdentityAllocator>,
    pub policy: Arc<dyn PolicyRepository>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub datapath: Arc<dyn HostDatapath>,
    pub proxy: Arc<dyn EndpointProxy>,
    pub dns: Arc<dyn DnsRulesApi>,
    pub metrics: EndpointMetrics,
}

/// Describes a new endpoint.
#[derive(Clone, Debug, Default)]
pub struct EndpointSpec {
    pub id: u16,
    pub if_name: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub k8s_namespace: Option<String>,
    pub k8s_pod_name: Option<String>,
    pub k8s_uid: Option<String>,
    pub container_name: Option<String>,
    pub labels: Labels,
    pub options: IntOptions,
}

/// A node-local network attachment point.
///
/// Endpoints are always handled through an `Arc`. Background tasks only hold
/// weak references, so dropping the last `Arc` stops them.
pub struct Endpoint {
    id: u16,
    if_name: String,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    container_name: Option<String>,
    kind: EndpointKind,
    props: Properties,

    inner: RwLock<Inner>,

    /// Held for the duration of a regeneration, a DNS state sync or a
    /// deletion. Taken before `inner` whenever both are needed.
    build: tokio::sync::Mutex<()>,

    /// Cancelled when the endpoint begins to shut down.
    alive: CancellationToken,
    controllers: Controllers,
    dns_sync: Trigger,
    proxy_stats: Mutex<ProxyStatsIndex>,

    deps: EndpointDeps,
    config: Arc<EndpointConfig>,
    this: Weak<Endpoint>,
}

/// Fields guarded by the main lock.
#[derive(Default)]
pub(crate) struct Inner {
    pub state: Option<State>,
    pub labels: OpLabels,
    pub identity: Option<Arc<Identity>>,

    /// Bumped on every identity label change so that resolutions started
    /// under older labels can tell they are stale.
    pub identity_revision: u64,

    /// The identity was restored from disk and the allocator does not hold
    /// a reference for it yet.
    pub unregistered_identity: bool,

    pub desired_policy: Arc<EndpointPolicy>,
    pub realized_policy: Arc<EndpointPolicy>,
    pub policy_revision: u64,
    pub next_policy_revision: u64,
    pub proxy_policy_revision: u64,
    pub force_policy_compute: bool,

    /// The highest level of any regeneration request absorbed by an already
    /// queued regeneration.
    pub skipped_level: endpoint_agent_core::RegenerationLevel,

    pub options: IntOptions,

    pub dns_rules: DnsRules,
    pub dns_history: DnsHistory,
    pub dns_zombies: DnsZombies,

    pub k8s_namespace: Option<String>,
    pub k8s_pod_name: Option<String>,
    pub k8s_uid: Option<String>,
    pub pod: Option<PodInfo>,
    pub k8s_ports: Vec<ContainerPort>,
    pub no_track_port: u16,

    pub datapath_config: BTreeMap<String, String>,

    pub status: StatusLog,

    pub signals: HashMap<u64, PolicySignal>,
    pub next_signal: u64,
}

// === impl Endpoint ===

impl Endpoint {
    /// Creates an endpoint that waits for its identity to be resolved.
    ///
    /// An empty label set is replaced by `reserved:init`. Must be called from
    /// within a Tokio runtime.
    pub fn new(spec: EndpointSpec, deps: EndpointDeps, config: Arc<EndpointConfig>) -> Arc<Self> {
        Self::with_kind(EndpointKind::Workload, spec, deps, config)
    }

    pub fn with_kind(
        kind: EndpointKind,
        spec: EndpointSpec,
        deps: EndpointDeps,
        config: Arc<EndpointConfig>,
    ) -> Arc<Self> {
        let EndpointSpec {
            id,
            if_name,
            ipv4,
            ipv6,
            k8s_namespace,
            k8s_pod_name,
            k8s_uid,
            container_name,
            labels,
            mut options,
        } = spec;

        let labels = if labels.is_empty() {
            Labels::init()
        } else {
            labels
        };
        options.inherit(&config.default_options);

        let inner = Inner {
            labels: OpLabels::with_identity(labels),
            options,
            k8s_namespace,
            k8s_pod_name,
            k8s_uid,
            ..Default::default()
        };
        let ep = Self::assemble(
            kind,
            id,
            if_name,
            (ipv4, ipv6),
            container_name,
            inner,
            deps,
            config,
        );
        ep.unconditional_lock()
            .set_state(State::WaitingForIdentity, "Endpoint creation");
        ep
    }

    /// Creates the endpoint for the node's own network namespace. It starts
    /// out as `reserved:init` until [`Endpoint::init_with_node_labels`]
    /// assigns its labels.
    pub fn create_host(
        id: u16,
        if_name: impl Into<String>,
        deps: EndpointDeps,
        config: Arc<EndpointConfig>,
    ) -> Arc<Self> {
        let spec = EndpointSpec {
            id,
            if_name: if_name.into(),
            ..Default::default()
        };
        Self::with_kind(EndpointKind::Host, spec, deps, config)
    }

    /// Creates the endpoint standing in for the ingress proxy. It has no
    /// interface.
    pub fn create_ingress(id: u16, deps: EndpointDeps, config: Arc<EndpointConfig>) -> Arc<Self> {
        let spec = EndpointSpec {
            id,
            ..Default::default()
        };
        Self::with_kind(EndpointKind::Ingress, spec, deps, config)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        kind: EndpointKind,
        id: u16,
        if_name: String,
        (ipv4, ipv6): (Option<Ipv4Addr>, Option<Ipv6Addr>),
        container_name: Option<String>,
        mut inner: Inner,
        deps: EndpointDeps,
        config: Arc<EndpointConfig>,
    ) -> Arc<Self> {
        let unknown = EndpointPolicy::empty(NumericIdentity::UNKNOWN);
        let policy = Arc::new(unknown);
        inner.desired_policy = policy.clone();
        inner.realized_policy = policy;

        let alive = CancellationToken::new();
        Arc::new_cyclic(|this: &Weak<Self>| {
            let controllers = Controllers::new(alive.clone());
            let dns_sync = Trigger::spawn(
                &controllers,
                config.dns_sync_min_interval,
                alive.child_token(),
                dns_sync::header_file_sync(this.clone()),
            );
            Self {
                id,
                if_name,
                ipv4,
                ipv6,
                container_name,
                kind,
                props: kind.properties(),
                inner: RwLock::new(inner),
                build: tokio::sync::Mutex::new(()),
                alive,
                controllers,
                dns_sync,
                proxy_stats: Mutex::new(ProxyStatsIndex::default()),
                deps,
                config,
                this: this.clone(),
            }
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4
    }

    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        self.ipv6
    }

    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn properties(&self) -> Properties {
        self.props
    }

    pub fn is_host(&self) -> bool {
        self.kind == EndpointKind::Host
    }

    pub fn is_ingress(&self) -> bool {
        self.kind == EndpointKind::Ingress
    }

    pub fn state(&self) -> Option<State> {
        self.inner.read().state
    }

    pub fn is_disconnecting(&self) -> bool {
        matches!(
            self.state(),
            Some(State::Disconnecting | State::Disconnected)
        )
    }

    pub fn security_identity(&self) -> Option<Arc<Identity>> {
        self.inner.read().identity.clone()
    }

    /// The endpoint's numeric identity, or `UNKNOWN` while none is assigned.
    pub fn numeric_identity(&self) -> NumericIdentity {
        self.inner
            .read()
            .identity
            .as_ref()
            .map(|id| id.id)
            .unwrap_or(NumericIdentity::UNKNOWN)
    }

    pub fn labels(&self) -> Labels {
        self.inner.read().labels.all_labels()
    }

    pub fn op_labels(&self) -> OpLabels {
        self.inner.read().labels.clone()
    }

    pub fn identity_revision(&self) -> u64 {
        self.inner.read().identity_revision
    }

    pub fn policy_revision(&self) -> u64 {
        self.inner.read().policy_revision
    }

    pub fn next_policy_revision(&self) -> u64 {
        self.inner.read().next_policy_revision
    }

    pub fn proxy_policy_revision(&self) -> u64 {
        self.inner.read().proxy_policy_revision
    }

    pub fn options(&self) -> IntOptions {
        self.inner.read().options.clone()
    }

    pub fn status_log(&self) -> Vec<StatusEntry> {
        self.inner.read().status.entries().cloned().collect()
    }

    pub fn current_status(&self) -> StatusCode {
        self.inner.read().status.current_status()
    }

    pub fn k8s_namespace_and_pod_name(&self) -> Option<(String, String)> {
        let inner = self.inner.read();
        match (&inner.k8s_namespace, &inner.k8s_pod_name) {
            (Some(ns), Some(name)) => Some((ns.clone(), name.clone())),
            _ => None,
        }
    }

    pub fn k8s_ports(&self) -> Vec<ContainerPort> {
        self.inner.read().k8s_ports.clone()
    }

    pub fn pod(&self) -> Option<PodInfo> {
        self.inner.read().pod.clone()
    }

    pub fn dns_rules(&self) -> DnsRules {
        self.inner.read().dns_rules.clone()
    }

    /// Whether the policy currently enforced admits traffic from `peer`.
    pub fn allows(&self, peer: NumericIdentity) -> bool {
        self.inner.read().realized_policy.allows_ingress(peer)
    }

    pub fn desired_policy(&self) -> Arc<EndpointPolicy> {
        self.inner.read().desired_policy.clone()
    }

    pub fn realized_policy(&self) -> Arc<EndpointPolicy> {
        self.inner.read().realized_policy.clone()
    }

    /// Requests a validated state transition, returning whether it happened.
    pub fn set_state(&self, to: State, reason: &str) -> bool {
        match self.lock_alive() {
            Ok(mut ep) => ep.set_state(to, reason),
            Err(_) => false,
        }
    }

    /// Stops background work, flushing pending DNS state first.
    pub async fn stop(&self) {
        self.alive.cancel();
        self.dns_sync.shutdown().await;
    }

    /// Stops the endpoint without tearing down host state, as at agent
    /// shutdown.
    pub async fn close(&self) {
        self.stop().await;
        self.controllers.remove_all();
        self.controllers.wait().await;
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    fn info(&self, inner: &Inner) -> EndpointInfo {
        EndpointInfo {
            id: self.id,
            if_name: self.if_name.clone(),
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            identity: inner
                .identity
                .as_ref()
                .map(|id| id.id)
                .unwrap_or(NumericIdentity::UNKNOWN),
            options: inner.options.clone(),
            at_host_ns: self.props.at_host_ns,
            policy_revision: inner.policy_revision,
        }
    }

    fn controller_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.id)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.alive.cancel();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("if_name", &self.if_name)
            .field("state", &self.inner.read().state)
            .finish_non_exhaustive()
    }
}
