use anyhow::{Context, Result};
use endpoint_agent_core::{dns::InMemoryDnsRules, labels::Labels, metadata::MetadataResolver};
use endpoint_agent_endpoint::{
    filter_endpoint_dirs, select_restore_dirs, Endpoint, EndpointConfig, EndpointDeps,
};
use futures::future;
use parking_lot::Mutex;
use std::{collections::BTreeMap, io, sync::Arc};
use tracing::{debug, info, warn};

/// The endpoints managed on this node.
pub struct Agent {
    deps: EndpointDeps,
    dns: Arc<InMemoryDnsRules>,
    config: Arc<EndpointConfig>,
    endpoints: Mutex<BTreeMap<u16, Arc<Endpoint>>>,
}

// === impl Agent ===

impl Agent {
    const MAX_ENDPOINT_ID: u16 = 4095;

    pub fn new(deps: EndpointDeps, dns: Arc<InMemoryDnsRules>, config: Arc<EndpointConfig>) -> Self {
        Self {
            deps,
            dns,
            config,
            endpoints: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, id: u16) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.endpoints.lock().keys().copied().collect()
    }

    /// Restores every endpoint persisted under the state directory, then
    /// regenerates them. Returns the number of endpoints restored.
    ///
    /// Directories that fail to restore are skipped.
    pub async fn restore(&self, resolver: Arc<dyn MetadataResolver>) -> Result<usize> {
        let names = match self.state_dir_entries().await {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %self.config.state_dir.display(), "No state directory to restore");
                return Ok(0);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read {}", self.config.state_dir.display())
                })
            }
        };

        let dirs = filter_endpoint_dirs(names);
        let mut restored = Vec::new();
        for (id, dir) in select_restore_dirs(&dirs) {
            let path = self.config.state_dir.join(&dir);
            match Endpoint::restore_from_dir(&path, self.deps.clone(), self.config.clone()).await {
                Ok(ep) => {
                    debug!(endpoint.id = id, %dir, "Restored endpoint");
                    self.dns.restore_rules(ep.id(), ep.dns_rules());
                    self.endpoints.lock().insert(ep.id(), ep.clone());
                    restored.push(ep);
                }
                Err(error) => warn!(endpoint.id = id, %dir, %error, "Failed to restore endpoint"),
            }
        }

        for ep in &restored {
            ep.run_restored_metadata_resolver(resolver.clone()).await;
        }
        let regenerated = future::join_all(restored.iter().map(|ep| ep.regenerate_after_restore()))
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        info!(restored = restored.len(), regenerated, "Restored endpoints");
        Ok(restored.len())
    }

    async fn state_dir_entries(&self) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.config.state_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Returns the host endpoint, creating it if none was restored, and
    /// assigns it the node's labels.
    pub async fn ensure_host(&self, if_name: &str, node_labels: &Labels) -> Result<Arc<Endpoint>> {
        let existing = self
            .endpoints
            .lock()
            .values()
            .find(|ep| ep.is_host())
            .cloned();
        let host = match existing {
            Some(host) => host,
            None => {
                let id = self.free_id().context("no endpoint ID available for the host")?;
                let host =
                    Endpoint::create_host(id, if_name, self.deps.clone(), self.config.clone());
                self.endpoints.lock().insert(id, host.clone());
                info!(endpoint.id = id, %if_name, "Created host endpoint");
                host
            }
        };
        host.init_with_node_labels(node_labels).await;
        Ok(host)
    }

    fn free_id(&self) -> Option<u16> {
        let endpoints = self.endpoints.lock();
        (1..=Self::MAX_ENDPOINT_ID).find(|id| !endpoints.contains_key(id))
    }

    /// Stops every endpoint without tearing down its host state.
    pub async fn close(&self) {
        let endpoints = std::mem::take(&mut *self.endpoints.lock());
        future::join_all(endpoints.values().map(|ep| ep.close())).await;
        debug!(endpoints = endpoints.len(), "Closed endpoints");
    }
}
