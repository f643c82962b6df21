use crate::LabelFilter;
use anyhow::{Context, Result};
use endpoint_agent_core::labels::{Labels, SOURCE_NODE};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};

/// Fetches the identity-relevant labels of the named node, tagged with the
/// `node` source.
pub async fn node_labels(client: Client, name: &str, filter: &LabelFilter) -> Result<Labels> {
    let node = Api::<Node>::all(client)
        .get(name)
        .await
        .with_context(|| format!("failed to get node {name}"))?;
    let (labels, _) = filter.split(node.labels(), SOURCE_NODE);
    Ok(labels)
}
