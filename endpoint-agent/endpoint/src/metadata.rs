use crate::{controller::ControllerParams, Endpoint, EndpointKind};
use endpoint_agent_core::{
    labels::{Labels, SOURCE_ANY, SOURCE_K8S},
    metadata::{MetadataResolver, PodMetadata},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::oneshot, time};
use tracing::{debug, info, warn};

type ResultTx = Arc<Mutex<Option<oneshot::Sender<bool>>>>;

impl Endpoint {
    /// Resolves the endpoint's pod metadata in a one-shot controller that
    /// retries until it succeeds, then applies the pod's labels.
    ///
    /// When `blocking`, waits for the first attempt and returns whether it
    /// triggered a regeneration. Otherwise returns false immediately.
    pub async fn run_metadata_resolver(
        self: &Arc<Self>,
        restored: bool,
        blocking: bool,
        base_labels: Labels,
        resolver: Arc<dyn MetadataResolver>,
    ) -> bool {
        let Some((ns, pod)) = self.k8s_namespace_and_pod_name() else {
            debug!(endpoint.id = self.id, "No pod to resolve metadata for");
            return false;
        };
        let uid = self.inner.read().k8s_uid.clone();

        let (tx, rx) = oneshot::channel();
        let tx: ResultTx = Arc::new(Mutex::new(Some(tx)));
        let ep = Arc::downgrade(self);
        let name = format!("resolve-labels-{ns}/{pod}");
        self.controllers
            .update_controller(name, ControllerParams::default(), move |token| {
                let ep = ep.clone();
                let resolver = resolver.clone();
                let base_labels = base_labels.clone();
                let (ns, pod, uid) = (ns.clone(), pod.clone(), uid.clone());
                let tx = tx.clone();
                async move {
                    let Some(ep) = ep.upgrade() else {
                        return Ok(());
                    };
                    let resolved = tokio::select! {
                        biased;
                        _ = token.cancelled() => return Ok(()),
                        res = resolver.resolve(&ns, &pod, uid.as_deref()) => res,
                    };
                    let res = match resolved {
                        Ok(meta) => Ok(ep.apply_pod_metadata(&base_labels, meta, blocking).await),
                        Err(error) if restored && error.is_not_found() => {
                            info!(endpoint.id = ep.id, %error, "Pod of restored endpoint not found; retrying");
                            Err(error)
                        }
                        Err(error) => {
                            if !restored {
                                ep.update_labels(SOURCE_ANY, &Labels::init(), &Labels::new(), blocking)
                                    .await;
                            }
                            Err(error)
                        }
                    };

                    let regenerated = *res.as_ref().unwrap_or(&false);
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(regenerated);
                    }
                    res.map(|_| ()).map_err(Into::into)
                }
            });

        if !blocking {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Starts a background metadata resolution for a restored endpoint.
    pub async fn run_restored_metadata_resolver(self: &Arc<Self>, resolver: Arc<dyn MetadataResolver>) {
        self.run_metadata_resolver(true, false, Labels::new(), resolver)
            .await;
    }

    async fn apply_pod_metadata(
        self: &Arc<Self>,
        base_labels: &Labels,
        meta: PodMetadata,
        blocking: bool,
    ) -> bool {
        let PodMetadata {
            pod,
            container_ports,
            identity_labels,
            info_labels,
        } = meta;
        {
            let Ok(mut ep) = self.lock_alive() else {
                return false;
            };
            ep.no_track_port = pod.no_track_port().unwrap_or(0);
            ep.pod = Some(pod);
            ep.k8s_ports = container_ports;
        }

        let mut labels = base_labels.clone();
        labels.merge(&identity_labels);
        let filter = if base_labels.is_empty() {
            SOURCE_K8S
        } else {
            SOURCE_ANY
        };
        self.update_labels(filter, &labels, &info_labels, blocking)
            .await
    }

    /// Assigns the host endpoint its labels: `reserved:host` plus the node's
    /// labels.
    pub async fn init_with_node_labels(self: &Arc<Self>, node_labels: &Labels) {
        if self.kind != EndpointKind::Host {
            return;
        }
        let mut labels = Labels::host();
        labels.merge(node_labels);
        self.init_reserved_labels(labels).await;
    }

    pub async fn init_with_ingress_labels(self: &Arc<Self>) {
        if self.kind != EndpointKind::Ingress {
            return;
        }
        self.init_reserved_labels(Labels::ingress()).await;
    }

    async fn init_reserved_labels(self: &Arc<Self>, labels: Labels) {
        let info = Labels::new();
        let update = self.update_labels(SOURCE_ANY, &labels, &info, true);
        if time::timeout(self.config.launch_time, update).await.is_err() {
            warn!(
                endpoint.id = self.id,
                timeout = ?self.config.launch_time,
                "Timed out assigning the initial identity"
            );
        }
    }
}
