use crate::State;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use std::time::Duration;

/// Metrics shared by all endpoints on the node.
#[derive(Clone, Debug)]
pub struct EndpointMetrics {
    state: Family<StateLabels, Gauge>,
    proxy_policy_l7: Family<ProxyL7Labels, Counter>,
    regenerations: Family<OutcomeLabels, Counter>,
    regeneration_duration: Histogram,
    policy_revision_waits: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StateLabels {
    endpoint_state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProxyL7Labels {
    rule: String,
    proxy_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self {
            state: Family::default(),
            proxy_policy_l7: Family::default(),
            regenerations: Family::default(),
            regeneration_duration: Histogram::new(exponential_buckets(0.005, 2.0, 14)),
            policy_revision_waits: Gauge::default(),
        }
    }
}

impl EndpointMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "state",
            "Count of endpoints in each state",
            metrics.state.clone(),
        );
        prom.register(
            "proxy_policy_l7",
            "Count of L7 proxy flows, by rule outcome",
            metrics.proxy_policy_l7.clone(),
        );
        prom.register(
            "regenerations",
            "Count of completed endpoint regenerations",
            metrics.regenerations.clone(),
        );
        prom.register(
            "regeneration_duration_seconds",
            "Time spent regenerating endpoints",
            metrics.regeneration_duration.clone(),
        );
        prom.register(
            "policy_revision_waits",
            "Number of callers waiting for an endpoint policy revision",
            metrics.policy_revision_waits.clone(),
        );
        metrics
    }

    pub fn state_count(&self, state: State) -> i64 {
        self.state.get_or_create(&StateLabels::from(state)).get()
    }

    pub fn proxy_l7_count(&self, rule: &str, proxy_type: &str) -> u64 {
        self.proxy_policy_l7
            .get_or_create(&ProxyL7Labels {
                rule: rule.to_string(),
                proxy_type: proxy_type.to_string(),
            })
            .get()
    }

    pub fn pending_revision_waits(&self) -> i64 {
        self.policy_revision_waits.get()
    }

    pub(crate) fn state_changed(&self, from: Option<State>, to: State) {
        if let Some(from) = from {
            self.state.get_or_create(&StateLabels::from(from)).dec();
        }
        if to.is_counted() {
            self.state.get_or_create(&StateLabels::from(to)).inc();
        }
    }

    pub(crate) fn proxy_l7(&self, rule: &str, proxy_type: &str) {
        self.proxy_policy_l7
            .get_or_create(&ProxyL7Labels {
                rule: rule.to_string(),
                proxy_type: proxy_type.to_string(),
            })
            .inc();
    }

    pub(crate) fn regeneration(&self, outcome: Outcome, elapsed: Duration) {
        let outcome = match outcome {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        };
        self.regenerations
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
        self.regeneration_duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn revision_waits_added(&self) {
        self.policy_revision_waits.inc();
    }

    pub(crate) fn revision_waits_removed(&self, n: usize) {
        self.policy_revision_waits.dec_by(n as i64);
    }
}

impl From<State> for StateLabels {
    fn from(state: State) -> Self {
        Self {
            endpoint_state: state.to_string(),
        }
    }
}
