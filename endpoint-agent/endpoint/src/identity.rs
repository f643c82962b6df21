use crate::{controller::ControllerParams, Endpoint, Error, State};
use endpoint_agent_core::{
    identity::{allocation_is_local, Identity},
    RegenerationLevel, RegenerationMetadata,
};
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

use crate::status::{StatusCode, StatusType};

enum Resolution {
    Obsolete,
    Assigned {
        old: Option<Arc<Identity>>,
        regenerate: bool,
    },
}

impl Endpoint {
    /// Resolves the endpoint's identity from its current identity labels.
    ///
    /// The resolution runs inline when `blocking` is set or when the labels
    /// can be resolved without a round-trip; a periodic background resolution
    /// is always registered. Returns whether a regeneration was triggered.
    pub async fn run_identity_resolver(self: &Arc<Self>, blocking: bool) -> bool {
        let (labels, rev) = match self.lock_alive() {
            Ok(ep) => (ep.labels.identity_labels(), ep.identity_revision),
            Err(_) => return false,
        };

        let mut regenerating = false;
        let mut start_delay = Duration::ZERO;
        if blocking || allocation_is_local(&labels) {
            start_delay = self.config.identity_resolve_interval;
            match self.identity_labels_changed(rev).await {
                Ok(r) => regenerating = r,
                Err(Error::NotAlive) => return false,
                Err(error) => debug!(endpoint.id = self.id, %error, "Inline identity resolution failed"),
            }
        }

        let ep = Arc::downgrade(self);
        let params = ControllerParams {
            run_interval: self.config.identity_resolve_interval,
            start_delay,
        };
        self.controllers
            .update_controller(self.controller_name("resolve-identity"), params, move |_| {
                let ep = ep.clone();
                async move {
                    let Some(ep) = ep.upgrade() else {
                        return Ok(());
                    };
                    match ep.identity_labels_changed(rev).await {
                        Ok(_) | Err(Error::NotAlive) => Ok(()),
                        Err(error) => Err(error.into()),
                    }
                }
            });

        regenerating
    }

    /// Whether a resolution started at identity revision `rev` has been
    /// superseded.
    fn resolution_is_obsolete(&self, rev: u64) -> bool {
        match self.lock_alive() {
            Ok(ep) => ep.identity_revision != rev,
            Err(_) => true,
        }
    }

    pub(crate) async fn identity_labels_changed(self: &Arc<Self>, rev: u64) -> Result<bool, Error> {
        let (labels, old, hint) = {
            let mut ep = self.lock_alive()?;
            if ep.identity_revision != rev {
                debug!(endpoint.id = self.id, "Obsolete identity resolution skipped");
                return Ok(false);
            }

            let labels = ep.labels.identity_labels();
            let mut hint = None;
            if let Some(id) = ep.identity.as_ref() {
                if id.labels == labels {
                    if ep.unregistered_identity {
                        hint = Some(id.id);
                    } else {
                        if ep.state == Some(State::WaitingForIdentity) {
                            ep.set_state(State::Ready, "Set identity for this endpoint");
                        }
                        return Ok(false);
                    }
                }
            }
            (labels, ep.identity.clone(), hint)
        };

        debug!(endpoint.id = self.id, %labels, ?hint, "Resolving identity");
        let allocation = tokio::select! {
            biased;
            _ = self.alive.cancelled() => return Err(Error::Cancelled),
            res = self.deps.allocator.allocate_identity(&labels, true, hint) => res,
        };
        let identity = match allocation {
            Ok((identity, _)) => identity,
            Err(error) => {
                warn!(endpoint.id = self.id, %error, "Unable to resolve identity");
                if let Ok(mut ep) = self.lock_alive() {
                    ep.log_status(
                        StatusType::Other,
                        StatusCode::Warning,
                        format!("Unable to resolve identity: {error} (will retry)"),
                    );
                }
                return Err(Error::Allocation(error));
            }
        };

        if self.resolution_is_obsolete(rev) {
            self.release_identity(&identity).await;
            return Ok(false);
        }

        // Give the rest of the cluster time to learn about the new identity
        // before traffic uses it. Leaving `init` is never delayed.
        if let Some(old) = old.as_ref().filter(|o| !o.is_init() && o.id != identity.id) {
            debug!(
                endpoint.id = self.id,
                old = %old.id,
                new = %identity.id,
                "Waiting for the identity change grace period"
            );
            let grace = time::sleep(self.config.identity_change_grace_period);
            tokio::select! {
                biased;
                _ = self.alive.cancelled() => {
                    self.release_identity(&identity).await;
                    return Err(Error::Cancelled);
                }
                _ = grace => {}
            }
        }

        let resolution = {
            let Ok(mut ep) = self.lock_alive() else {
                self.release_identity(&identity).await;
                return Err(Error::NotAlive);
            };
            if ep.identity_revision != rev {
                Resolution::Obsolete
            } else {
                let mut old = ep.identity.replace(identity.clone());
                if std::mem::take(&mut ep.unregistered_identity) {
                    // The allocator never counted the restored identity.
                    old = None;
                }
                info!(
                    endpoint.id = self.id,
                    identity = %identity.id,
                    old = ?old.as_ref().map(|o| o.id),
                    "Identity of endpoint changed"
                );
                if ep.state == Some(State::WaitingForIdentity) {
                    ep.set_state(State::Ready, "Set identity for this endpoint");
                }

                let regenerate = self.id != 0
                    && ep.set_regenerate_state(&RegenerationMetadata::new(
                        "updated security labels",
                        RegenerationLevel::WithDatapath,
                    ));
                ep.force_policy_compute = true;
                Resolution::Assigned { old, regenerate }
            }
        };

        match resolution {
            Resolution::Obsolete => {
                self.release_identity(&identity).await;
                Ok(false)
            }
            Resolution::Assigned { old, regenerate } => {
                if let Some(old) = old {
                    self.release_old_identity(old);
                }
                if regenerate {
                    self.regenerate(RegenerationMetadata::new(
                        "updated security labels",
                        RegenerationLevel::WithDatapath,
                    ));
                }
                Ok(regenerate)
            }
        }
    }

    /// Registers an identity restored from disk with the allocator, asking
    /// for the same numeric identity back. If the allocator hands out a
    /// different one, the endpoint switches to it.
    pub(crate) async fn register_restored_identity(&self) {
        let restored = match self.lock_alive() {
            Ok(ep) if ep.unregistered_identity => ep.identity.clone(),
            _ => None,
        };
        let Some(restored) = restored else {
            return;
        };

        let allocation = self
            .deps
            .allocator
            .allocate_identity(&restored.labels, true, Some(restored.id))
            .await;
        let identity = match allocation {
            Ok((identity, _)) => identity,
            Err(error) => {
                warn!(endpoint.id = self.id, identity = %restored.id, %error, "Unable to restore identity");
                return;
            }
        };

        let registered = match self.lock_alive() {
            Ok(mut ep)
                if ep.unregistered_identity
                    && ep.identity.as_ref().is_some_and(|i| Arc::ptr_eq(i, &restored)) =>
            {
                ep.unregistered_identity = false;
                if identity.id != restored.id {
                    info!(
                        endpoint.id = self.id,
                        restored = %restored.id,
                        identity = %identity.id,
                        "Restored identity is taken; using a new one"
                    );
                    ep.force_policy_compute = true;
                }
                ep.identity = Some(identity.clone());
                true
            }
            _ => false,
        };
        if !registered {
            self.release_identity(&identity).await;
        }
    }

    /// Releases an identity the endpoint no longer refers to. Failures are
    /// only logged.
    pub(crate) async fn release_identity(&self, identity: &Identity) {
        if identity.is_init() {
            return;
        }
        if let Err(error) = self.deps.allocator.release(identity, false).await {
            warn!(endpoint.id = self.id, identity = %identity.id, %error, "Unable to release identity");
        }
    }

    fn release_old_identity(self: &Arc<Self>, old: Arc<Identity>) {
        let ep = self.clone();
        let span = tracing::debug_span!("sync-identity-release", endpoint.id = self.id);
        self.controllers.spawn(tracing::Instrument::instrument(
            async move { ep.release_identity(&old).await },
            span,
        ));
    }
}
