use crate::{DeleteErrors, Endpoint, State};
use anyhow::{Context, Result};
use std::{io, path::Path, sync::Arc};
use tracing::{info, warn};

/// Controls how much of an endpoint's shared state is torn down on delete.
#[derive(Clone, Debug, Default)]
pub struct DeleteConfig {
    /// Keep the identity allocated, as when the endpoint is about to be
    /// recreated with the same labels.
    pub no_identity_release: bool,
}

// === impl Endpoint ===

impl Endpoint {
    /// Removes the endpoint and everything it installed on the host.
    ///
    /// Teardown continues past individual failures, which are all returned.
    /// Deleting an endpoint that is already being removed is a no-op.
    pub async fn delete(&self, conf: DeleteConfig) -> Result<(), DeleteErrors> {
        self.stop().await;

        let build = self.build_lock().await;
        let (info, desired, realized, identity, no_track_port) = {
            let Ok(mut ep) = self.lock_alive() else {
                return Ok(());
            };
            // Teardown proceeds even when the transition is refused.
            ep.set_state(State::Disconnecting, "Deleting endpoint");
            (
                self.info(&ep),
                ep.desired_policy.clone(),
                ep.realized_policy.clone(),
                ep.identity.clone().filter(|_| !ep.unregistered_identity),
                ep.no_track_port,
            )
        };

        let mut errors = DeleteErrors::default();
        let mut check = |res: Result<()>| {
            if let Err(error) = res {
                warn!(endpoint.id = self.id, "{error:#}");
                errors.push(error);
            }
        };

        let datapath = &self.deps.datapath;
        if self.config.manage_routing_rules && (self.ipv4.is_some() || self.ipv6.is_some()) {
            check(
                datapath
                    .delete_routing_rules(&info)
                    .await
                    .context("unable to remove routing rules"),
            );
        }
        if no_track_port > 0 {
            check(
                datapath
                    .remove_no_track_rules(&info, no_track_port)
                    .await
                    .context("unable to remove no-track rules"),
            );
        }

        if !self.props.is_fake {
            if !self.if_name.is_empty() {
                check(
                    datapath
                        .set_link_down(&self.if_name)
                        .await
                        .with_context(|| format!("unable to set link {} down", self.if_name)),
                );
            }
            self.deps.orchestrator.unload(&info).await;
            if self.props.has_datapath {
                check(
                    datapath
                        .delete_endpoint_maps(self.id)
                        .await
                        .context("unable to delete endpoint maps"),
                );
            }
        }

        self.deps.policy.detach(self.id, &desired);
        self.deps
            .proxy
            .remove_redirects(self.id, &desired.redirects)
            .await;
        if !Arc::ptr_eq(&desired, &realized) {
            self.deps.policy.detach(self.id, &realized);
            self.deps
                .proxy
                .remove_redirects(self.id, &realized.redirects)
                .await;
        }
        self.deps.dns.remove_restored_dns_rules(self.id);

        if self.props.has_policy_map {
            check(
                datapath
                    .close_policy_map(self.id)
                    .await
                    .context("unable to close policy map"),
            );
        }

        if let Some(identity) = identity {
            if !conf.no_identity_release && !identity.is_init() {
                check(
                    self.deps
                        .allocator
                        .release(&identity, false)
                        .await
                        .map(|_| ())
                        .context("unable to release identity"),
                );
            }
        }

        if !self.props.is_fake {
            check(
                datapath
                    .scrub_conntrack(&info)
                    .await
                    .context("unable to scrub conntrack entries"),
            );
        }

        let dir = self.config.endpoint_dir(self.id);
        for suffix in ["", "_next", "_next_fail"] {
            let path = dir.with_file_name(format!("{}{suffix}", self.id));
            check(remove_dir(&path).await);
        }

        self.controllers.remove_all();
        {
            let mut ep = self.unconditional_lock();
            ep.clean_policy_signals();
            ep.set_state(State::Disconnected, "Endpoint removed");
        }
        drop(build);
        self.controllers.wait().await;

        info!(endpoint.id = self.id, "Removed endpoint");
        errors.ok_if_empty()
    }
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("unable to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}
