use crate::labels::Labels;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The subset of a pod the endpoint keeps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub service_account: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContainerPort {
    pub name: Option<String>,
    pub port: u16,
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodMetadata {
    pub pod: PodInfo,
    pub container_ports: Vec<ContainerPort>,
    pub identity_labels: Labels,
    pub info_labels: Labels,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("pod {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Looks up orchestration metadata for an endpoint.
#[async_trait::async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(
        &self,
        namespace: &str,
        pod_name: &str,
        uid: Option<&str>,
    ) -> Result<PodMetadata, ResolveError>;
}

/// The annotation carrying the port for which connection tracking is
/// bypassed.
pub const NO_TRACK_PORT_ANNOTATION: &str = "endpoint-agent.io/no-track-port";

impl PodInfo {
    pub fn no_track_port(&self) -> Option<u16> {
        self.annotations
            .get(NO_TRACK_PORT_ANNOTATION)
            .and_then(|v| v.trim().parse().ok())
            .filter(|p| *p > 0)
    }
}

impl ResolveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
