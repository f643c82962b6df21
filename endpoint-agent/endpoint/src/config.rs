use endpoint_agent_core::options::{IntOptions, OptionLibrary};
use std::{path::PathBuf, time::Duration};

/// Agent-wide settings shared by every endpoint.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// How long a new identity is withheld after an identity change, so that
    /// peers can learn about it before traffic flows under it.
    pub identity_change_grace_period: Duration,

    /// Interval of the background identity re-resolution.
    pub identity_resolve_interval: Duration,

    pub dns_sync_min_interval: Duration,

    /// Upper bound on a single regeneration.
    pub regeneration_timeout: Duration,

    /// Upper bound on waiting for proxy acknowledgements. When unset, the wait
    /// is bounded by `regeneration_timeout` only.
    pub proxy_wait_timeout: Option<Duration>,

    pub regeneration_recovery_interval: Duration,

    pub state_change_poll_interval: Duration,
    pub state_change_timeout: Duration,

    /// Bound on the initial identity assignment of the host and ingress
    /// endpoints.
    pub launch_time: Duration,

    pub state_dir: PathBuf,

    /// Keep restored option values instead of resetting them to the defaults.
    pub keep_config: bool,

    pub manage_routing_rules: bool,

    pub option_library: OptionLibrary,
    pub default_options: IntOptions,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            identity_change_grace_period: Duration::from_secs(5),
            identity_resolve_interval: Duration::from_secs(5 * 60),
            dns_sync_min_interval: Duration::from_secs(5),
            regeneration_timeout: Duration::from_secs(330),
            proxy_wait_timeout: None,
            regeneration_recovery_interval: Duration::from_secs(10),
            state_change_poll_interval: Duration::from_secs(1),
            state_change_timeout: Duration::from_secs(30),
            launch_time: Duration::from_secs(30),
            state_dir: PathBuf::from("/var/run/endpoint-agent/state"),
            keep_config: false,
            manage_routing_rules: false,
            option_library: OptionLibrary::default(),
            default_options: IntOptions::default(),
        }
    }
}

impl EndpointConfig {
    pub fn endpoint_dir(&self, id: u16) -> PathBuf {
        self.state_dir.join(id.to_string())
    }
}
