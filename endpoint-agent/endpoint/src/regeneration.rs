use crate::{
    controller::ControllerParams,
    lock::{Alive, Locked},
    metrics::Outcome,
    status::{StatusCode, StatusType},
    Endpoint, Error, State,
};
use endpoint_agent_core::{proxy::Completion, RegenerationLevel, RegenerationMetadata};
use futures::future;
use std::time::Duration;
use tokio::{task::JoinHandle, time};
use tracing::{debug, error, info_span, Instrument};

// === impl Locked ===

impl Locked<'_, Alive> {
    /// Queues a regeneration.
    ///
    /// If one is already queued, the request is folded into it and `false` is
    /// returned.
    pub fn set_regenerate_state(&mut self, meta: &RegenerationMetadata) -> bool {
        match self.state {
            Some(current @ (State::WaitingToRegenerate | State::Restoring)) => {
                self.skipped_level = self.skipped_level.max(meta.level);
                self.set_state(
                    current,
                    &format!(
                        "Skipped duplicate endpoint regeneration trigger due to {}",
                        meta.reason
                    ),
                );
                false
            }
            _ => self.set_state(
                State::WaitingToRegenerate,
                &format!("Triggering endpoint regeneration due to {}", meta.reason),
            ),
        }
    }
}

// === impl Endpoint ===

impl Endpoint {
    /// Queues a regeneration and runs it in the background. Returns false if
    /// the endpoint couldn't be queued, either because it is being removed or
    /// because a regeneration is already pending.
    pub fn regenerate_if_alive(&self, meta: RegenerationMetadata) -> bool {
        let queued = match self.lock_alive() {
            Ok(mut ep) => ep.set_regenerate_state(&meta),
            Err(_) => false,
        };
        if queued {
            self.regenerate(meta);
        }
        queued
    }

    /// Runs a regeneration in the background. The endpoint must already be
    /// queued or restoring; otherwise the build is skipped.
    ///
    /// The handle resolves to whether the build completed.
    pub fn regenerate(&self, meta: RegenerationMetadata) -> JoinHandle<bool> {
        let ep = self.this.clone();
        let alive = self.alive.clone();
        let span = info_span!("regenerate", endpoint.id = self.id, reason = %meta.reason);
        self.controllers.spawn(
            async move {
                let Some(ep) = ep.upgrade() else {
                    return false;
                };
                tokio::select! {
                    biased;
                    _ = alive.cancelled() => {
                        debug!("Endpoint is being removed; regeneration cancelled");
                        false
                    }
                    built = ep.regenerate_and_report(meta) => built,
                }
            }
            .instrument(span),
        )
    }

    /// Regenerates a restored endpoint, which is in the `Restoring` state.
    pub async fn regenerate_after_restore(&self) -> bool {
        self.register_restored_identity().await;
        let meta = RegenerationMetadata::new(
            "syncing state to host",
            RegenerationLevel::WithDatapath,
        );
        self.regenerate(meta).await.unwrap_or(false)
    }

    async fn regenerate_and_report(&self, meta: RegenerationMetadata) -> bool {
        let start = time::Instant::now();
        let res = match time::timeout(self.config.regeneration_timeout, self.build(&meta)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        };

        match res {
            Ok(true) => {
                self.deps
                    .metrics
                    .regeneration(Outcome::Success, start.elapsed());
                self.controllers
                    .remove_controller(&self.controller_name("regeneration-recovery"));
                true
            }
            Ok(false) => false,
            Err(Error::NotAlive) => {
                debug!("Endpoint is being removed; regeneration abandoned");
                false
            }
            Err(error) => {
                self.deps
                    .metrics
                    .regeneration(Outcome::Failure, start.elapsed());
                self.regeneration_failed(&error);
                false
            }
        }
    }

    fn regeneration_failed(&self, error: &Error) {
        error!(endpoint.id = self.id, %error, "Error regenerating endpoint");
        match self.lock_alive() {
            Ok(mut ep) => {
                ep.log_status(
                    StatusType::Bpf,
                    StatusCode::Failure,
                    format!("Error regenerating endpoint: {error}"),
                );
                ep.force_policy_compute = true;
            }
            Err(_) => return,
        }

        let ep = self.this.clone();
        let params = ControllerParams {
            run_interval: Duration::ZERO,
            start_delay: self.config.regeneration_recovery_interval,
        };
        self.controllers.update_controller(
            self.controller_name("regeneration-recovery"),
            params,
            move |_| {
                let ep = ep.clone();
                async move {
                    if let Some(ep) = ep.upgrade() {
                        ep.regenerate_if_alive(RegenerationMetadata::new(
                            "retrying regeneration",
                            RegenerationLevel::WithDatapath,
                        ));
                    }
                    Ok(())
                }
            },
        );
    }

    /// Returns `Ok(false)` when the build is skipped.
    async fn build(&self, meta: &RegenerationMetadata) -> Result<bool, Error> {
        let build = self.build_lock().await;

        let (reload, info, policy, revision) = {
            let Ok(mut ep) = self.lock_alive() else {
                return Ok(false);
            };
            if !ep.builder_set_state(
                &build,
                State::Regenerating,
                &format!("Regenerating endpoint: {}", meta.reason),
            ) {
                debug!(state = ?ep.state, "Skipping build due to invalid state");
                return Ok(false);
            }

            let level = meta.level.max(ep.skipped_level);
            ep.skipped_level = RegenerationLevel::Invalid;

            let identity = ep.identity.clone().ok_or(Error::InvalidIdentity)?;
            let repo_revision = self.deps.policy.revision();
            if ep.force_policy_compute
                || ep.next_policy_revision < repo_revision
                || ep.desired_policy.identity != identity.id
            {
                let policy = self
                    .deps
                    .policy
                    .compute_policy(self.id, &identity)
                    .map_err(Error::Regeneration)?;
                ep.desired_policy = policy;
                ep.force_policy_compute = false;
                ep.next_policy_revision = ep.next_policy_revision.max(repo_revision);
            }

            let reload = level == RegenerationLevel::WithDatapath
                && self.props.has_datapath
                && !self.props.skip_regeneration;
            (
                reload,
                self.info(&ep),
                ep.desired_policy.clone(),
                ep.next_policy_revision,
            )
        };

        // The main lock is released for the long-running steps below.
        if reload {
            self.deps
                .orchestrator
                .reload_datapath(&info)
                .await
                .map_err(Error::Regeneration)?;
        }

        let update = self
            .deps
            .proxy
            .update_redirects(self.id, &policy)
            .await
            .map_err(Error::Regeneration)?;
        for (key, port) in &update.ports {
            if let Some(redirect) = policy.redirects.get(key) {
                self.proxy_statistics(key, &redirect.l7_protocol, *port);
            }
        }
        self.wait_for_proxy_completions(update.completions).await?;

        if self.props.has_policy_map {
            self.deps
                .orchestrator
                .sync_policy_map(&info, &policy)
                .await
                .map_err(Error::Regeneration)?;
        }

        let mut ep = self.lock_alive()?;
        ep.realized_policy = policy;
        ep.proxy_policy_revision = ep.proxy_policy_revision.max(revision);
        ep.set_policy_revision(revision);
        ep.builder_set_state(&build, State::Ready, "Completed endpoint regeneration");
        ep.log_status(
            StatusType::Bpf,
            StatusCode::Ok,
            format!(
                "Successfully regenerated endpoint program (Reason: {})",
                meta.reason
            ),
        );
        Ok(true)
    }

    async fn wait_for_proxy_completions(&self, completions: Vec<Completion>) -> Result<(), Error> {
        if completions.is_empty() {
            return Ok(());
        }

        let all = future::try_join_all(completions);
        let wait = async {
            let res = match self.config.proxy_wait_timeout {
                Some(timeout) => time::timeout(timeout, all)
                    .await
                    .map_err(|_| Error::ProxyWait)?,
                None => all.await,
            };
            res.map(|_| ()).map_err(Error::Regeneration)
        };

        tokio::select! {
            biased;
            _ = self.alive.cancelled() => Err(Error::Cancelled),
            res = wait => res,
        }
    }
}
