use super::*;
use anyhow::{anyhow, bail, Result};
use endpoint_agent_core::{
    dns::{InMemoryDnsRules, PortProto},
    identity::LocalAllocator,
    labels::SOURCE_K8S,
    metadata::{MetadataResolver, PodMetadata, ResolveError, NO_TRACK_PORT_ANNOTATION},
    policy::{Redirect, RedirectKey, StaticPolicyRepository},
    proxy::{Completion, RedirectUpdate},
    RegenerationLevel, RegenerationMetadata,
};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio::{sync::Semaphore, time};

// === mocks ===

#[derive(Default)]
struct TestAllocator {
    inner: LocalAllocator,
    allocations: AtomicUsize,
    releases: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait::async_trait]
impl IdentityAllocator for TestAllocator {
    async fn allocate_identity(
        &self,
        labels: &Labels,
        notify_selector_cache: bool,
        hint: Option<NumericIdentity>,
    ) -> Result<(Arc<Identity>, bool)> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        self.inner
            .allocate_identity(labels, notify_selector_cache, hint)
            .await
    }

    async fn release(&self, identity: &Identity, notify_selector_cache: bool) -> Result<bool> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(identity, notify_selector_cache).await
    }
}

#[derive(Default)]
struct TestDatapath {
    reloads: AtomicUsize,
    failing_reloads: AtomicUsize,
    policy_syncs: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl TestDatapath {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl Orchestrator for TestDatapath {
    async fn reload_datapath(&self, _: &EndpointInfo) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_reloads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reloads.store(failing - 1, Ordering::SeqCst);
            bail!("compilation failed");
        }
        Ok(())
    }

    async fn sync_policy_map(&self, _: &EndpointInfo, _: &EndpointPolicy) -> Result<()> {
        self.policy_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self, _: &EndpointInfo) {
        self.record("unload");
    }
}

#[async_trait::async_trait]
impl HostDatapath for TestDatapath {
    async fn delete_routing_rules(&self, _: &EndpointInfo) -> Result<()> {
        self.record("delete_routing_rules");
        Ok(())
    }

    async fn remove_no_track_rules(&self, _: &EndpointInfo, port: u16) -> Result<()> {
        self.record(format!("remove_no_track_rules:{port}"));
        Ok(())
    }

    async fn set_link_down(&self, if_name: &str) -> Result<()> {
        self.record(format!("set_link_down:{if_name}"));
        Ok(())
    }

    async fn delete_endpoint_maps(&self, _: u16) -> Result<()> {
        self.record("delete_endpoint_maps");
        Err(anyhow!("map busy"))
    }

    async fn close_policy_map(&self, _: u16) -> Result<()> {
        self.record("close_policy_map");
        Ok(())
    }

    async fn scrub_conntrack(&self, _: &EndpointInfo) -> Result<()> {
        self.record("scrub_conntrack");
        Ok(())
    }
}

#[derive(Default)]
struct TestProxy {
    gate: Option<Arc<Semaphore>>,
    removals: AtomicUsize,
}

#[async_trait::async_trait]
impl EndpointProxy for TestProxy {
    async fn update_redirects(&self, _: u16, _: &EndpointPolicy) -> Result<RedirectUpdate> {
        let mut update = RedirectUpdate::default();
        if let Some(gate) = self.gate.clone() {
            let ack: Completion = Box::pin(async move {
                gate.acquire().await?.forget();
                Ok(())
            });
            update.completions.push(ack);
        }
        Ok(update)
    }

    async fn remove_redirects(&self, _: u16, _: &BTreeMap<RedirectKey, Redirect>) {
        self.removals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TestResolver {
    calls: AtomicUsize,
    fail_first: bool,
}

#[async_trait::async_trait]
impl MetadataResolver for TestResolver {
    async fn resolve(
        &self,
        namespace: &str,
        pod_name: &str,
        _uid: Option<&str>,
    ) -> Result<PodMetadata, ResolveError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 && self.fail_first {
            return Err(ResolveError::Other(anyhow!("apiserver unavailable")));
        }
        Ok(PodMetadata {
            pod: PodInfo {
                namespace: namespace.to_string(),
                name: pod_name.to_string(),
                uid: "uid-1".to_string(),
                service_account: Some("default".to_string()),
                annotations: btreemap! {
                    NO_TRACK_PORT_ANNOTATION.to_string() => "8080".to_string(),
                },
            },
            container_ports: vec![ContainerPort {
                name: Some("http".to_string()),
                port: 8080,
                protocol: "TCP".to_string(),
            }],
            identity_labels: Labels::parse_all([
                "k8s:app=web",
                "k8s:io.kubernetes.pod.namespace=default",
            ]),
            info_labels: Labels::parse_all(["k8s:pod-template-hash=5d8f"]),
        })
    }
}

// === harness ===

struct Harness {
    allocator: Arc<TestAllocator>,
    datapath: Arc<TestDatapath>,
    proxy: Arc<TestProxy>,
    policy: Arc<StaticPolicyRepository>,
    dns: Arc<InMemoryDnsRules>,
    metrics: EndpointMetrics,
    config: Arc<EndpointConfig>,
    _state_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with(TestAllocator::default(), TestProxy::default())
    }

    fn with(allocator: TestAllocator, proxy: TestProxy) -> Self {
        let state_dir = tempfile::tempdir().expect("must create state dir");
        let config = EndpointConfig {
            state_dir: state_dir.path().to_path_buf(),
            ..Default::default()
        };
        Self {
            allocator: Arc::new(allocator),
            datapath: Arc::new(TestDatapath::default()),
            proxy: Arc::new(proxy),
            policy: Arc::new(StaticPolicyRepository::default()),
            dns: Arc::new(InMemoryDnsRules::default()),
            metrics: EndpointMetrics::default(),
            config: Arc::new(config),
            _state_dir: state_dir,
        }
    }

    fn deps(&self) -> EndpointDeps {
        EndpointDeps {
            allocator: self.allocator.clone(),
            policy: self.policy.clone(),
            orchestrator: self.datapath.clone(),
            datapath: self.datapath.clone(),
            proxy: self.proxy.clone(),
            dns: self.dns.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn workload(&self, id: u16, labels: &[&str]) -> Arc<Endpoint> {
        let spec = EndpointSpec {
            id,
            if_name: format!("lxc{id}"),
            ipv4: Some(Ipv4Addr::new(10, 0, 0, id as u8)),
            labels: Labels::parse_all(labels.iter().copied()),
            ..Default::default()
        };
        Endpoint::new(spec, self.deps(), self.config.clone())
    }

    /// A workload that has an identity and has completed its first build.
    async fn ready_workload(&self, id: u16, labels: &[&str]) -> Arc<Endpoint> {
        let ep = self.workload(id, labels);
        assert!(ep.run_identity_resolver(true).await);
        ep.wait_for_first_regeneration(CancellationToken::new())
            .await
            .expect("first regeneration must complete");
        ep
    }
}

async fn until(mut f: impl FnMut() -> bool) {
    for _ in 0..6000 {
        if f() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn gauges(metrics: &EndpointMetrics) -> Vec<(State, i64)> {
    ALL_STATES
        .iter()
        .map(|s| (*s, metrics.state_count(*s)))
        .filter(|(_, n)| *n != 0)
        .collect()
}

// === lifecycle ===

#[tokio::test]
async fn new_endpoint_waits_for_identity() {
    let h = Harness::new();
    let ep = h.workload(1, &[]);

    assert_eq!(ep.state(), Some(State::WaitingForIdentity));
    assert!(ep.is_init());
    assert_eq!(ep.numeric_identity(), NumericIdentity::UNKNOWN);
    assert_eq!(gauges(&h.metrics), vec![(State::WaitingForIdentity, 1)]);
    assert_eq!(
        ep.status_log().last().map(|e| e.message.clone()),
        Some("Endpoint creation".to_string())
    );
}

#[tokio::test]
async fn invalid_transitions_are_logged_not_applied() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);

    assert!(!ep.set_state(State::Regenerating, "test"));
    assert_eq!(ep.state(), Some(State::WaitingForIdentity));
    let last = ep.status_log().pop().expect("status must be logged");
    assert_eq!(last.code, StatusCode::Warning);
    assert_eq!(
        last.message,
        "Skipped invalid state transition to regenerating due to: test"
    );

    assert!(ep.set_state(State::Ready, "test"));
    assert_eq!(gauges(&h.metrics), vec![(State::Ready, 1)]);
}

#[tokio::test]
async fn repeated_transitions_are_recorded() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);
    assert!(ep.set_state(State::Ready, "test"));

    assert!(!ep.set_state(State::Ready, "again"));
    assert_eq!(ep.state(), Some(State::Ready));
    let last = ep.status_log().pop().expect("status must be logged");
    assert_eq!(last.code, StatusCode::Warning);
    assert_eq!(
        last.message,
        "Skipped invalid state transition to ready due to: again"
    );
}

#[tokio::test]
async fn resolves_identity_and_regenerates() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;

    assert_eq!(ep.state(), Some(State::Ready));
    assert!(ep.numeric_identity() >= NumericIdentity::MIN_ALLOCATED);
    assert_eq!(ep.policy_revision(), 1);
    assert_eq!(ep.proxy_policy_revision(), 1);
    assert_eq!(h.datapath.reloads.load(Ordering::SeqCst), 1);
    assert_eq!(h.datapath.policy_syncs.load(Ordering::SeqCst), 1);
    assert!(ep.allows(NumericIdentity::WORLD));
    assert_eq!(ep.current_status(), StatusCode::Ok);
    assert_eq!(gauges(&h.metrics), vec![(State::Ready, 1)]);
}

#[tokio::test]
async fn equal_labels_share_an_identity() {
    let h = Harness::new();
    let a = h.ready_workload(1, &["k8s:app=web"]).await;
    let b = h.ready_workload(2, &["k8s:app=web"]).await;
    assert_eq!(a.numeric_identity(), b.numeric_identity());
}

// === deletion ===

#[tokio::test]
async fn delete_tears_down_once() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;

    let errors = ep
        .delete(DeleteConfig::default())
        .await
        .expect_err("map deletion failure must be reported");
    assert_eq!(errors.len(), 1);
    assert_eq!(ep.state(), Some(State::Disconnected));
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 1);
    assert!(h.allocator.inner.is_empty());
    assert_eq!(
        h.datapath.calls(),
        vec![
            "set_link_down:lxc1",
            "unload",
            "delete_endpoint_maps",
            "close_policy_map",
            "scrub_conntrack",
        ]
    );
    // Desired and realized policy are the same after a build.
    assert_eq!(h.proxy.removals.load(Ordering::SeqCst), 1);
    assert!(gauges(&h.metrics).is_empty());

    ep.delete(DeleteConfig::default())
        .await
        .expect("second delete is a no-op");
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.datapath.calls().len(), 5);
    assert!(!ep.set_state(State::Ready, "test"));
}

#[tokio::test]
async fn concurrent_deletes_tear_down_once() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;

    let (a, b) = tokio::join!(
        ep.delete(DeleteConfig::default()),
        ep.delete(DeleteConfig::default())
    );
    assert_eq!([a.is_err(), b.is_err()].iter().filter(|e| **e).count(), 1);
    assert_eq!(ep.state(), Some(State::Disconnected));
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 1);
    assert!(h.allocator.inner.is_empty());
    assert_eq!(h.datapath.calls().len(), 5);
}

#[tokio::test]
async fn delete_can_keep_identity() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;

    let _ = ep
        .delete(DeleteConfig {
            no_identity_release: true,
        })
        .await;
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 0);
    assert_eq!(h.allocator.inner.len(), 1);
}

#[tokio::test]
async fn delete_resolves_revision_waits() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);

    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    let wait = ep.wait_for_policy_revision(
        CancellationToken::new(),
        5,
        Some(Box::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        })),
    );
    assert_eq!(h.metrics.pending_revision_waits(), 1);

    let _ = ep.delete(DeleteConfig::default()).await;
    wait.await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(h.metrics.pending_revision_waits(), 0);

    let mut late = ep.wait_for_policy_revision(CancellationToken::new(), 5, None);
    assert!(late.is_ready());
}

// === policy revisions ===

#[tokio::test]
async fn revision_waits_resolve_at_wanted_revision() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);

    let mut five = ep.wait_for_policy_revision(CancellationToken::new(), 5, None);
    let ctx = CancellationToken::new();
    let mut cancelled = ep.wait_for_policy_revision(ctx.clone(), 10, None);

    ep.set_policy_revision(4).await;
    assert!(!five.is_ready());
    assert!(!cancelled.is_ready());

    ep.set_policy_revision(3).await;
    assert_eq!(ep.policy_revision(), 4);

    ctx.cancel();
    ep.set_policy_revision(5).await;
    assert!(five.is_ready());
    assert!(cancelled.is_ready());
    assert_eq!(ep.policy_revision(), 5);
    assert_eq!(h.metrics.pending_revision_waits(), 0);

    ep.on_proxy_policy_update(7);
    ep.on_proxy_policy_update(6);
    assert_eq!(ep.proxy_policy_revision(), 7);
}

#[tokio::test]
async fn first_regeneration_wait_fails_on_cancel() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);

    let ctx = CancellationToken::new();
    ctx.cancel();
    assert!(matches!(
        ep.wait_for_first_regeneration(ctx).await,
        Err(Error::Cancelled)
    ));
}

// === labels ===

#[tokio::test]
async fn adding_labels_leaves_init() {
    let h = Harness::new();
    let ep = h.workload(1, &[]);
    assert!(ep.is_init());

    ep.modify_identity_labels(SOURCE_K8S, &Labels::parse_all(["app=web"]), &Labels::new())
        .await
        .expect("labels must be modified");

    assert!(!ep.is_init());
    assert_eq!(ep.identity_revision(), 1);
    assert_eq!(ep.labels(), Labels::parse_all(["k8s:app=web"]));
    assert!(ep.has_labels(&Labels::parse_all(["k8s:app=web"])));

    until(|| ep.numeric_identity() >= NumericIdentity::MIN_ALLOCATED).await;
}

#[tokio::test]
async fn deleting_unknown_labels_fails() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);

    let res = ep
        .modify_identity_labels(SOURCE_K8S, &Labels::new(), &Labels::parse_all(["k8s:tier=db"]))
        .await;
    assert!(matches!(res, Err(Error::Labels(_))));
    assert_eq!(ep.identity_revision(), 0);
    assert_eq!(ep.labels(), Labels::parse_all(["k8s:app=web"]));
}

#[tokio::test]
async fn stale_identity_resolution_is_released() {
    let gate = Arc::new(Semaphore::new(0));
    let allocator = TestAllocator {
        gate: Some(gate.clone()),
        ..Default::default()
    };
    let h = Harness::with(allocator, TestProxy::default());
    let ep = h.workload(1, &["k8s:app=web"]);

    let rev = ep.identity_revision();
    let stale = tokio::spawn({
        let ep = ep.clone();
        async move { ep.identity_labels_changed(rev).await }
    });
    until(|| h.allocator.allocations.load(Ordering::SeqCst) == 1).await;

    ep.modify_identity_labels(SOURCE_K8S, &Labels::parse_all(["tier=db"]), &Labels::new())
        .await
        .expect("labels must be modified");
    until(|| h.allocator.allocations.load(Ordering::SeqCst) == 2).await;
    gate.add_permits(2);

    let res = stale.await.expect("task must not panic");
    assert!(matches!(res, Ok(false)));
    until(|| ep.numeric_identity() != NumericIdentity::UNKNOWN).await;
    until(|| h.allocator.releases.load(Ordering::SeqCst) == 1).await;

    let identity = ep.security_identity().expect("identity must be set");
    assert_eq!(
        identity.labels,
        Labels::parse_all(["k8s:app=web", "k8s:tier=db"])
    );
    assert_eq!(h.allocator.inner.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn identity_change_waits_for_grace_period() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;
    let old = ep.numeric_identity();

    ep.modify_identity_labels(SOURCE_K8S, &Labels::parse_all(["tier=db"]), &Labels::new())
        .await
        .expect("labels must be modified");
    until(|| h.allocator.allocations.load(Ordering::SeqCst) == 2).await;
    let start = time::Instant::now();

    time::sleep(Duration::from_secs(4)).await;
    assert_eq!(ep.numeric_identity(), old);

    until(|| ep.numeric_identity() != old).await;
    assert!(start.elapsed() >= h.config.identity_change_grace_period - Duration::from_millis(50));
    until(|| h.allocator.releases.load(Ordering::SeqCst) == 1).await;
    assert_eq!(h.allocator.inner.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn leaving_init_skips_grace_period() {
    let h = Harness::new();
    let ep = h.workload(1, &["reserved:init"]);
    ep.run_identity_resolver(true).await;
    assert_eq!(ep.numeric_identity(), NumericIdentity::INIT);

    let start = time::Instant::now();
    ep.modify_identity_labels(SOURCE_K8S, &Labels::parse_all(["app=web"]), &Labels::new())
        .await
        .expect("labels must be modified");
    until(|| ep.numeric_identity() >= NumericIdentity::MIN_ALLOCATED).await;
    assert!(start.elapsed() < h.config.identity_change_grace_period);
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn label_change_during_grace_period_releases_new_identity() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;
    let old = ep.numeric_identity();

    let rev = {
        let mut locked = ep.lock_alive().expect("endpoint is alive");
        locked
            .labels
            .modify_identity_labels(&Labels::parse_all(["k8s:tier=db"]), &Labels::new())
            .expect("labels must be modified");
        locked.identity_revision += 1;
        locked.identity_revision
    };
    let pending = tokio::spawn({
        let ep = ep.clone();
        async move { ep.identity_labels_changed(rev).await }
    });
    until(|| h.allocator.allocations.load(Ordering::SeqCst) == 2).await;
    assert_eq!(h.allocator.inner.len(), 2);

    ep.modify_identity_labels(SOURCE_K8S, &Labels::new(), &Labels::parse_all(["k8s:tier=db"]))
        .await
        .expect("labels must be modified");

    let res = pending.await.expect("task must not panic");
    assert!(matches!(res, Ok(false)));
    assert_eq!(ep.numeric_identity(), old);
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.allocator.inner.len(), 1);
    until(|| ep.state() == Some(State::Ready)).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_grace_period_releases_new_identity() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;

    let rev = {
        let mut locked = ep.lock_alive().expect("endpoint is alive");
        locked
            .labels
            .modify_identity_labels(&Labels::parse_all(["k8s:tier=db"]), &Labels::new())
            .expect("labels must be modified");
        locked.identity_revision += 1;
        locked.identity_revision
    };
    let pending = tokio::spawn({
        let ep = ep.clone();
        async move { ep.identity_labels_changed(rev).await }
    });
    until(|| h.allocator.allocations.load(Ordering::SeqCst) == 2).await;

    assert!(ep.set_state(State::Disconnecting, "test"));
    let res = pending.await.expect("task must not panic");
    assert!(matches!(res, Err(Error::NotAlive)));
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.allocator.inner.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn superseded_background_resolution_releases_its_identity() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;

    ep.modify_identity_labels(SOURCE_K8S, &Labels::parse_all(["tier=db"]), &Labels::new())
        .await
        .expect("labels must be modified");
    until(|| h.allocator.allocations.load(Ordering::SeqCst) == 2).await;

    // Replaces the resolver controller while the first run waits out its
    // grace period.
    ep.modify_identity_labels(
        SOURCE_K8S,
        &Labels::parse_all(["tier=api"]),
        &Labels::parse_all(["k8s:tier=db"]),
    )
    .await
    .expect("labels must be modified");
    until(|| h.allocator.allocations.load(Ordering::SeqCst) == 3).await;
    until(|| {
        ep.security_identity()
            .map(|id| id.labels == Labels::parse_all(["k8s:app=web", "k8s:tier=api"]))
            .unwrap_or(false)
    })
    .await;

    time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.allocator.inner.len(), 1);
    assert_eq!(
        h.allocator.releases.load(Ordering::SeqCst),
        h.allocator.allocations.load(Ordering::SeqCst) - 1
    );
}

// === regeneration ===

#[tokio::test]
async fn requeued_build_keeps_waiting_state() {
    let gate = Arc::new(Semaphore::new(0));
    let proxy = TestProxy {
        gate: Some(gate.clone()),
        ..Default::default()
    };
    let h = Harness::with(TestAllocator::default(), proxy);
    let ep = h.workload(1, &["k8s:app=web"]);

    assert!(ep.run_identity_resolver(true).await);
    until(|| ep.state() == Some(State::Regenerating)).await;

    assert!(ep.set_state(State::WaitingToRegenerate, "test"));
    gate.add_permits(1);

    until(|| ep.policy_revision() == 1).await;
    assert_eq!(ep.state(), Some(State::WaitingToRegenerate));
}

#[tokio::test]
async fn duplicate_triggers_are_folded() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);
    assert!(ep.set_state(State::Ready, "test"));

    let without = RegenerationMetadata::new("a", RegenerationLevel::WithoutDatapath);
    let with = RegenerationMetadata::new("b", RegenerationLevel::WithDatapath);
    {
        let mut locked = ep.lock_alive().expect("endpoint is alive");
        assert!(locked.set_regenerate_state(&without));
        assert!(!locked.set_regenerate_state(&with));
        assert_eq!(locked.skipped_level, RegenerationLevel::WithDatapath);
    }
    assert_eq!(ep.state(), Some(State::WaitingToRegenerate));
}

#[tokio::test(start_paused = true)]
async fn failed_regeneration_is_retried() {
    let h = Harness::new();
    h.datapath.failing_reloads.store(1, Ordering::SeqCst);
    let ep = h.workload(1, &["k8s:app=web"]);

    assert!(ep.run_identity_resolver(true).await);
    until(|| ep.current_status() == StatusCode::Failure).await;
    assert_eq!(ep.state(), Some(State::Regenerating));
    assert_eq!(ep.policy_revision(), 0);

    until(|| ep.policy_revision() == 1).await;
    assert_eq!(ep.state(), Some(State::Ready));
    assert_eq!(h.datapath.reloads.load(Ordering::SeqCst), 2);
    assert_eq!(ep.current_status(), StatusCode::Ok);
}

// === restore ===

#[tokio::test]
async fn restore_drops_unknown_state() {
    let h = Harness::new();
    let s = SerializedEndpoint {
        id: 7,
        if_name: "lxc7".to_string(),
        labels: OpLabels::with_identity(Labels::parse_all(["k8s:app=web"])),
        ..Default::default()
    };
    let mut json = serde_json::to_value(&s).unwrap();
    json["securityIdentity"] = serde_json::json!({ "id": "bogus" });
    json["options"] = serde_json::json!({ "Debug": "enabled", "Bogus": "enabled" });

    let ep = Endpoint::restore(
        serde_json::to_vec(&json).unwrap().as_slice(),
        h.deps(),
        h.config.clone(),
    )
    .expect("endpoint must be restored");

    assert_eq!(ep.state(), Some(State::Restoring));
    assert_eq!(ep.kind(), EndpointKind::Workload);
    assert_eq!(ep.numeric_identity(), NumericIdentity::INIT);
    let options = ep.options();
    assert!(options.is_enabled("Debug"));
    assert!(options.iter().all(|(name, _)| name != "Bogus"));

    assert!(ep.regenerate_after_restore().await);
    assert_eq!(ep.state(), Some(State::Ready));
    assert_eq!(ep.policy_revision(), 1);
}

fn restored_workload(h: &Harness, id: u16, identity: u32, labels: &[&str]) -> Arc<Endpoint> {
    let labels = Labels::parse_all(labels.iter().copied());
    let s = SerializedEndpoint {
        id,
        if_name: format!("lxc{id}"),
        labels: OpLabels::with_identity(labels.clone()),
        security_identity: Some(Identity::new(NumericIdentity(identity), labels)),
        ..Default::default()
    };
    Endpoint::restore(&serde_json::to_vec(&s).unwrap(), h.deps(), h.config.clone())
        .expect("endpoint must be restored")
}

#[tokio::test]
async fn restored_identity_is_reserved_with_allocator() {
    let h = Harness::new();
    let restored = restored_workload(&h, 7, 256, &["k8s:app=web"]);
    assert!(restored.regenerate_after_restore().await);
    assert_eq!(restored.numeric_identity(), NumericIdentity(256));
    assert_eq!(h.allocator.inner.len(), 1);

    let other = h.ready_workload(2, &["k8s:app=db"]).await;
    assert_ne!(other.numeric_identity(), NumericIdentity(256));
    let same = h.ready_workload(3, &["k8s:app=web"]).await;
    assert_eq!(same.numeric_identity(), NumericIdentity(256));

    let _ = restored.delete(DeleteConfig::default()).await;
    assert_eq!(h.allocator.inner.len(), 2);
}

#[tokio::test]
async fn restored_identity_taken_by_other_labels_is_replaced() {
    let h = Harness::new();
    let other = h.ready_workload(2, &["k8s:app=db"]).await;
    assert_eq!(other.numeric_identity(), NumericIdentity(256));

    let restored = restored_workload(&h, 7, 256, &["k8s:app=web"]);
    assert!(restored.regenerate_after_restore().await);
    assert_ne!(restored.numeric_identity(), NumericIdentity(256));
    assert!(restored.numeric_identity() >= NumericIdentity::MIN_ALLOCATED);
    assert_eq!(h.allocator.inner.len(), 2);
    assert_eq!(h.allocator.releases.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn restore_detects_host() {
    let h = Harness::new();
    let s = SerializedEndpoint {
        id: 9,
        labels: OpLabels::with_identity(Labels::host()),
        ..Default::default()
    };
    let ep = Endpoint::restore(&serde_json::to_vec(&s).unwrap(), h.deps(), h.config.clone())
        .expect("endpoint must be restored");
    assert!(ep.is_host());
}

#[tokio::test]
async fn close_flushes_dns_state() {
    let h = Harness::new();
    let ep = h.workload(3, &["k8s:app=web"]);
    let rules = btreemap! {
        PortProto::new(53, "udp") => vec!["*.example.com".to_string()],
    };
    h.dns.set_rules(3, rules.clone());

    ep.sync_endpoint_header_file_async("test");
    ep.close().await;

    assert_eq!(ep.dns_rules(), rules);
    let path = h.config.endpoint_dir(3).join(ENDPOINT_CONFIG_FILE);
    let json = std::fs::read(path).expect("state must be written");
    let restored = serde_json::from_slice::<SerializedEndpoint>(&json).unwrap();
    assert_eq!(restored.dns_rules, rules);
    assert_eq!(restored.labels, ep.op_labels());
}

// === options ===

#[tokio::test]
async fn update_validates_before_applying() {
    let h = Harness::new();
    let ep = h.ready_workload(1, &["k8s:app=web"]).await;

    let res = ep
        .update(&btreemap! { "Bogus".to_string() => "on".to_string() })
        .await;
    assert!(matches!(res, Err(Error::Validation(_))));
    let res = ep
        .update(&btreemap! { "Debug".to_string() => "maybe".to_string() })
        .await;
    assert!(matches!(res, Err(Error::Validation(_))));
    assert!(!ep.options().is_enabled("Debug"));

    ep.update(&btreemap! { "Debug".to_string() => "on".to_string() })
        .await
        .expect("update must be queued");
    assert!(ep.options().is_enabled("Debug"));
    until(|| h.datapath.reloads.load(Ordering::SeqCst) == 2).await;
    until(|| ep.state() == Some(State::Ready)).await;
}

#[tokio::test(start_paused = true)]
async fn update_times_out_without_identity() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);

    let res = ep
        .update(&btreemap! { "Debug".to_string() => "on".to_string() })
        .await;
    assert!(matches!(res, Err(Error::StateChange(_))));
}

#[tokio::test]
async fn reserved_endpoints_only_accept_debug_options() {
    let h = Harness::new();
    let ep = h.workload(1, &["reserved:health"]);

    assert!(ep.api_can_modify().is_err());
    assert!(ep
        .api_can_modify_config(&btreemap! { "Debug".to_string() => "on".to_string() })
        .is_ok());
    assert!(ep
        .api_can_modify_config(&btreemap! { "DropNotification".to_string() => "on".to_string() })
        .is_err());

    let init = h.workload(2, &[]);
    assert!(init.api_can_modify().is_ok());
}

// === proxy statistics ===

#[tokio::test]
async fn proxy_statistics_are_counted() {
    let h = Harness::new();
    let ep = h.workload(1, &["k8s:app=web"]);
    let key = RedirectKey {
        ingress: true,
        protocol: "TCP".to_string(),
        port: 80,
    };
    ep.proxy_statistics(&key, "http", 10080);

    ep.update_proxy_statistics("http", "TCP", 80, 10080, true, true, Verdict::Forwarded);
    ep.update_proxy_statistics("http", "TCP", 80, 10080, true, true, Verdict::Denied);
    ep.update_proxy_statistics("http", "TCP", 80, 10080, true, false, Verdict::Error);
    ep.update_proxy_statistics("http", "TCP", 81, 10080, true, true, Verdict::Forwarded);

    assert_eq!(
        ep.proxy_statistics_snapshot(),
        vec![ProxyStatistics {
            location: "ingress".to_string(),
            protocol: "http".to_string(),
            port: 80,
            allocated_proxy_port: 10080,
            requests: MessageStatistics {
                received: 2,
                forwarded: 1,
                denied: 1,
                error: 0,
            },
            responses: MessageStatistics {
                received: 1,
                forwarded: 0,
                denied: 0,
                error: 1,
            },
        }]
    );
    assert_eq!(h.metrics.proxy_l7_count("received", "http"), 3);
    assert_eq!(h.metrics.proxy_l7_count("parse_errors", "http"), 1);
}

// === metadata ===

fn pod_workload(h: &Harness) -> Arc<Endpoint> {
    let spec = EndpointSpec {
        id: 4,
        if_name: "lxc4".to_string(),
        k8s_namespace: Some("default".to_string()),
        k8s_pod_name: Some("web-0".to_string()),
        ..Default::default()
    };
    Endpoint::new(spec, h.deps(), h.config.clone())
}

#[tokio::test]
async fn pod_metadata_replaces_init_labels() {
    let h = Harness::new();
    let ep = pod_workload(&h);
    let resolver = Arc::new(TestResolver::default());

    assert!(
        ep.run_metadata_resolver(false, true, Labels::new(), resolver.clone())
            .await
    );
    assert!(!ep.is_init());
    assert_eq!(
        ep.labels(),
        Labels::parse_all([
            "k8s:app=web",
            "k8s:io.kubernetes.pod.namespace=default",
            "k8s:pod-template-hash=5d8f",
        ])
    );
    assert_eq!(ep.pod().map(|p| p.name), Some("web-0".to_string()));
    assert_eq!(ep.k8s_ports().len(), 1);
    assert_eq!(ep.inner.read().no_track_port, 8080);
}

#[tokio::test(start_paused = true)]
async fn metadata_failures_are_retried() {
    let h = Harness::new();
    let ep = pod_workload(&h);
    let resolver = Arc::new(TestResolver {
        fail_first: true,
        ..Default::default()
    });

    assert!(
        !ep.run_metadata_resolver(false, true, Labels::new(), resolver.clone())
            .await
    );
    assert!(ep.is_init());

    until(|| !ep.is_init()).await;
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn host_takes_node_labels() {
    let h = Harness::new();
    let ep = Endpoint::create_host(2, "host0", h.deps(), h.config.clone());
    assert!(ep.is_init());

    ep.init_with_node_labels(&Labels::parse_all(["node:zone=a"]))
        .await;
    assert_eq!(ep.numeric_identity(), NumericIdentity::HOST);
    assert!(ep.has_labels(&Labels::parse_all(["reserved:host", "node:zone=a"])));

    let ingress = Endpoint::create_ingress(3, h.deps(), h.config.clone());
    ingress.init_with_ingress_labels().await;
    assert_eq!(ingress.numeric_identity(), NumericIdentity::INGRESS);
}
