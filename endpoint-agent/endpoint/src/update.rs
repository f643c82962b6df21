use crate::{status::StatusCode, Endpoint, Error, State};
use endpoint_agent_core::{options::DEBUG_OPTIONS, RegenerationLevel, RegenerationMetadata};
use std::collections::BTreeMap;
use tokio::time;
use tracing::debug;

impl Endpoint {
    /// Whether the endpoint's labels may be changed through the API.
    pub fn api_can_modify(&self) -> Result<(), Error> {
        let ep = self.inner.read();
        if ep.is_init() {
            return Ok(());
        }
        if ep.labels.orchestration_identity.is_reserved() {
            return Err(Error::Validation(
                "endpoint cannot be modified by API call".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `config` may be applied through the API. Endpoints with
    /// reserved labels only accept debugging options.
    pub fn api_can_modify_config(&self, config: &BTreeMap<String, String>) -> Result<(), Error> {
        if !self.inner.read().labels.orchestration_identity.is_reserved() {
            return Ok(());
        }
        match config.keys().find(|k| !DEBUG_OPTIONS.contains(&k.as_str())) {
            Some(name) => Err(Error::Validation(format!(
                "option {name} cannot be modified on an endpoint with reserved labels"
            ))),
            None => Ok(()),
        }
    }

    /// Applies user-supplied option changes and regenerates the endpoint.
    ///
    /// An empty map forces a full regeneration. Nothing is queued when the
    /// changes are no-ops and the endpoint is healthy.
    pub async fn update(&self, config: &BTreeMap<String, String>) -> Result<(), Error> {
        let changes = self
            .config
            .option_library
            .validate(config)
            .map_err(|e| Error::Validation(e.to_string()))?;

        let (applied, status) = {
            let mut ep = self.lock_alive()?;
            let applied = ep.options.apply(&self.config.option_library, &changes);
            (applied, ep.status.current_status())
        };

        if !config.is_empty() && applied.changed == 0 && status == StatusCode::Ok {
            debug!(endpoint.id = self.id, "Endpoint options unchanged");
            return Ok(());
        }

        let level = if config.is_empty() || applied.requires_datapath {
            RegenerationLevel::WithDatapath
        } else {
            RegenerationLevel::WithoutDatapath
        };
        let meta = RegenerationMetadata::new("endpoint was updated via API", level);

        let poll = async {
            let mut tick = time::interval(self.config.state_change_poll_interval);
            loop {
                tick.tick().await;
                if self.queue_update_regeneration(&meta)? {
                    return Ok::<_, Error>(());
                }
            }
        };
        match time::timeout(self.config.state_change_timeout, poll).await {
            Ok(res) => res,
            Err(_) => Err(Error::StateChange(
                "timed out waiting for endpoint state to change".to_string(),
            )),
        }
    }

    /// Returns true once the regeneration is queued, either by this call or
    /// by a regeneration that was already pending.
    fn queue_update_regeneration(&self, meta: &RegenerationMetadata) -> Result<bool, Error> {
        let queued = {
            let mut ep = self.lock_alive()?;
            match ep.state {
                Some(State::WaitingToRegenerate) => {
                    ep.skipped_level = ep.skipped_level.max(meta.level);
                    return Ok(true);
                }
                _ => ep.set_regenerate_state(meta),
            }
        };
        if queued {
            self.regenerate(meta.clone());
        }
        Ok(queued)
    }
}
