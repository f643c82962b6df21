use crate::policy::{EndpointPolicy, Redirect, RedirectKey};
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::BTreeMap;

/// Resolves once the proxy has acknowledged a redirect update.
pub type Completion = BoxFuture<'static, Result<()>>;

#[derive(Default)]
pub struct RedirectUpdate {
    /// The proxy port allocated for each redirect.
    pub ports: BTreeMap<RedirectKey, u16>,
    pub completions: Vec<Completion>,
}

/// The L7 proxy as seen from a single endpoint.
#[async_trait::async_trait]
pub trait EndpointProxy: Send + Sync {
    async fn update_redirects(&self, endpoint_id: u16, policy: &EndpointPolicy) -> Result<RedirectUpdate>;

    /// Purges the given redirects. An empty `redirects` is a no-op.
    async fn remove_redirects(&self, endpoint_id: u16, redirects: &BTreeMap<RedirectKey, Redirect>);
}

impl std::fmt::Debug for RedirectUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectUpdate")
            .field("ports", &self.ports)
            .field("completions", &self.completions.len())
            .finish()
    }
}
