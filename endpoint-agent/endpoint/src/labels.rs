use crate::{lock::Alive, lock::Locked, Endpoint, Error, Inner, State};
use endpoint_agent_core::labels::{Label, Labels, ID_NAME_INIT, SOURCE_ANY, SOURCE_UNSPEC};
use std::sync::Arc;
use tracing::debug;

impl Inner {
    pub(crate) fn is_init(&self) -> bool {
        self.labels.identity_labels().has_init_label()
    }
}

impl Locked<'_, Alive> {
    /// Replaces identity labels, bumping the identity revision on change.
    pub fn replace_identity_labels(&mut self, source_filter: &str, labels: &Labels) -> bool {
        let changed = self.labels.replace_identity_labels(source_filter, labels);
        if changed {
            self.identity_revision += 1;
        }
        changed
    }
}

impl Endpoint {
    pub fn is_init(&self) -> bool {
        self.inner.read().is_init()
    }

    /// Whether every label in `labels` is set on the endpoint with the same
    /// value.
    pub fn has_labels(&self, labels: &Labels) -> bool {
        let all = self.inner.read().labels.all_labels();
        labels.iter().all(|l| {
            all.get(&l.key)
                .map(|have| l.matches(have))
                .unwrap_or(false)
        })
    }

    /// Replaces the labels coming from `source_filter` and resolves a new
    /// identity if the identity labels changed. Returns whether a
    /// regeneration was triggered.
    pub async fn update_labels(
        self: &Arc<Self>,
        source_filter: &str,
        identity: &Labels,
        info: &Labels,
        blocking: bool,
    ) -> bool {
        let changed = {
            let Ok(mut ep) = self.lock_alive() else {
                return false;
            };
            ep.labels.replace_information_labels(source_filter, info);
            let mut changed = ep.replace_identity_labels(source_filter, identity);

            // A filtered replace leaves labels from other sources in place,
            // including `reserved:init`. Drop it once real labels arrive.
            if !identity.is_empty()
                && source_filter != SOURCE_ANY
                && !identity.has_init_label()
                && ep.is_init()
            {
                let mut labels = ep.labels.identity_labels();
                labels.remove(ID_NAME_INIT);
                changed |= ep.replace_identity_labels(SOURCE_ANY, &labels);
            }
            changed
        };

        if !changed {
            return false;
        }
        self.run_identity_resolver(blocking).await
    }

    /// Applies a user-driven identity label edit and starts a background
    /// identity resolution if anything changed.
    ///
    /// Added labels without a source are attributed to `source`.
    pub async fn modify_identity_labels(
        self: &Arc<Self>,
        source: &str,
        add: &Labels,
        del: &Labels,
    ) -> Result<(), Error> {
        let add = add
            .iter()
            .map(|l| {
                if l.source == SOURCE_UNSPEC {
                    Label::new(l.key.clone(), l.value.clone(), source)
                } else {
                    l.clone()
                }
            })
            .collect::<Labels>();

        {
            let mut ep = self.lock_alive()?;
            let mut changed = ep.labels.modify_identity_labels(&add, del)?;

            let adds_real_labels = add.iter().any(|l| !(l.is_reserved() && l.key == ID_NAME_INIT));
            if ep.is_init() && ((add.is_empty() && del.is_empty()) || adds_real_labels) {
                changed |= ep.labels.remove_identity_label(ID_NAME_INIT);
            }

            if !changed {
                debug!(endpoint.id = self.id, "Identity labels unchanged");
                return Ok(());
            }
            ep.set_state(
                State::WaitingForIdentity,
                "Triggering identity resolution due to updated identity labels",
            );
            ep.identity_revision += 1;
        }

        self.run_identity_resolver(false).await;
        Ok(())
    }
}
