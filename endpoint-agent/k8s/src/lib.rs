#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod filter;
mod node;
mod pod;

pub use self::{
    filter::LabelFilter,
    node::node_labels,
    pod::{pod_metadata, KubeMetadataResolver, POD_NAMESPACE_LABEL, SERVICE_ACCOUNT_LABEL},
};
pub use k8s_openapi::api::core::v1::{Node, Pod};
pub use kube::{Api, Client, ResourceExt};
