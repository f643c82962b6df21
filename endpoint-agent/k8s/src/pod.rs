use crate::LabelFilter;
use anyhow::Context;
use endpoint_agent_core::{
    labels::{Label, SOURCE_K8S},
    metadata::{ContainerPort, MetadataResolver, PodInfo, PodMetadata, ResolveError},
};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, trace};

pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
pub const SERVICE_ACCOUNT_LABEL: &str = "io.cilium.k8s.policy.serviceaccount";

/// Resolves endpoint metadata from pods in the Kubernetes API.
#[derive(Clone)]
pub struct KubeMetadataResolver {
    client: Client,
    filter: LabelFilter,
}

// === impl KubeMetadataResolver ===

impl KubeMetadataResolver {
    pub fn new(client: Client) -> Self {
        Self::with_filter(client, LabelFilter::default())
    }

    pub fn with_filter(client: Client, filter: LabelFilter) -> Self {
        Self { client, filter }
    }
}

#[async_trait::async_trait]
impl MetadataResolver for KubeMetadataResolver {
    async fn resolve(
        &self,
        namespace: &str,
        pod_name: &str,
        uid: Option<&str>,
    ) -> Result<PodMetadata, ResolveError> {
        let not_found = || ResolveError::NotFound {
            namespace: namespace.to_string(),
            name: pod_name.to_string(),
        };

        let pod = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .get_opt(pod_name)
            .await
            .with_context(|| format!("failed to get pod {namespace}/{pod_name}"))?
            .ok_or_else(not_found)?;

        if let Some(uid) = uid.filter(|u| !u.is_empty()) {
            if pod.uid().as_deref() != Some(uid) {
                debug!(%namespace, pod = %pod_name, %uid, "Pod UID does not match");
                return Err(not_found());
            }
        }

        Ok(pod_metadata(&pod, &self.filter))
    }
}

/// Converts a pod into the metadata an endpoint keeps.
///
/// The pod's labels are split by `filter`. The namespace and service account
/// are added as identity labels.
pub fn pod_metadata(pod: &Pod, filter: &LabelFilter) -> PodMetadata {
    let namespace = pod.namespace().unwrap_or_default();
    let service_account = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.clone())
        .filter(|sa| !sa.is_empty());

    let (mut identity_labels, info_labels) = filter.split(pod.labels(), SOURCE_K8S);
    identity_labels.insert(Label::new(POD_NAMESPACE_LABEL, &*namespace, SOURCE_K8S));
    if let Some(sa) = &service_account {
        identity_labels.insert(Label::new(SERVICE_ACCOUNT_LABEL, &**sa, SOURCE_K8S));
    }

    PodMetadata {
        pod: PodInfo {
            namespace,
            name: pod.name_any(),
            uid: pod.uid().unwrap_or_default(),
            service_account,
            annotations: pod.annotations().clone(),
        },
        container_ports: container_ports(pod),
        identity_labels,
        info_labels,
    }
}

fn container_ports(pod: &Pod) -> Vec<ContainerPort> {
    let mut ports = Vec::new();
    let Some(spec) = pod.spec.as_ref() else {
        return ports;
    };
    for container in &spec.containers {
        for p in container.ports.iter().flatten() {
            let Ok(port) = u16::try_from(p.container_port) else {
                debug!(port = p.container_port, "Ignoring invalid container port");
                continue;
            };
            trace!(port, name = ?p.name, "Adding port");
            ports.push(ContainerPort {
                name: p.name.clone(),
                port,
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            });
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_agent_core::metadata::NO_TRACK_PORT_ANNOTATION;
    use k8s_openapi::{
        api::core::v1::{Container, ContainerPort as K8sPort, PodSpec},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use pretty_assertions::assert_eq;

    fn mk_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("web-0".to_string()),
                uid: Some("uid-0".to_string()),
                labels: Some(maplit::btreemap! {
                    "app".to_string() => "web".to_string(),
                    "pod-template-hash".to_string() => "5d8f".to_string(),
                }),
                annotations: Some(maplit::btreemap! {
                    NO_TRACK_PORT_ANNOTATION.to_string() => "8080".to_string(),
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some("web".to_string()),
                containers: vec![Container {
                    name: "app".to_string(),
                    ports: Some(vec![
                        K8sPort {
                            container_port: 8080,
                            name: Some("http".to_string()),
                            ..Default::default()
                        },
                        K8sPort {
                            container_port: 53,
                            protocol: Some("UDP".to_string()),
                            ..Default::default()
                        },
                        K8sPort {
                            container_port: 70000,
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn converts_pod() {
        let meta = pod_metadata(&mk_pod(), &LabelFilter::default());
        assert_eq!(
            meta.identity_labels.to_model(),
            vec![
                "k8s:app=web".to_string(),
                "k8s:io.cilium.k8s.policy.serviceaccount=web".to_string(),
                "k8s:io.kubernetes.pod.namespace=ns-0".to_string(),
            ]
        );
        assert_eq!(
            meta.info_labels.to_model(),
            vec!["k8s:pod-template-hash=5d8f".to_string()]
        );
        assert_eq!(meta.pod.uid, "uid-0");
        assert_eq!(meta.pod.service_account.as_deref(), Some("web"));
        assert_eq!(meta.pod.no_track_port(), Some(8080));
        assert_eq!(
            meta.container_ports,
            vec![
                ContainerPort {
                    name: Some("http".to_string()),
                    port: 8080,
                    protocol: "TCP".to_string(),
                },
                ContainerPort {
                    name: None,
                    port: 53,
                    protocol: "UDP".to_string(),
                },
            ]
        );
    }

    #[test]
    fn pod_without_spec() {
        let mut pod = mk_pod();
        pod.spec = None;
        let meta = pod_metadata(&pod, &LabelFilter::default());
        assert!(meta.container_ports.is_empty());
        assert_eq!(meta.pod.service_account, None);
        assert!(!meta
            .identity_labels
            .contains_key(SERVICE_ACCOUNT_LABEL));
    }
}
