use crate::{Endpoint, EndpointConfig, EndpointDeps, EndpointKind, Error, Inner, State};
use endpoint_agent_core::{
    dns::{DnsHistory, DnsRules, DnsZombies},
    identity::Identity,
    options::IntOptions,
    OpLabels,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
    sync::Arc,
};
use tracing::debug;

pub const ENDPOINT_CONFIG_FILE: &str = "ep_config.json";

const NEXT_SUFFIX: &str = "_next";
const NEXT_FAIL_SUFFIX: &str = "_next_fail";

/// The persisted form of an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedEndpoint {
    pub id: u16,
    #[serde(default)]
    pub if_name: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub k8s_namespace: Option<String>,
    #[serde(default)]
    pub k8s_pod_name: Option<String>,
    #[serde(default)]
    pub k8s_uid: Option<String>,
    #[serde(default)]
    pub labels: OpLabels,

    /// A corrupt identity is treated as missing.
    #[serde(default, deserialize_with = "lenient")]
    pub security_identity: Option<Identity>,

    #[serde(default)]
    pub options: IntOptions,
    #[serde(default)]
    pub dns_rules: DnsRules,
    #[serde(default)]
    pub dns_history: DnsHistory,
    #[serde(default)]
    pub dns_zombies: DnsZombies,
    #[serde(default)]
    pub datapath_configuration: BTreeMap<String, String>,
    #[serde(default)]
    pub no_track_port: u16,
}

fn lenient<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Selects the endpoint state directories among the entries of the state
/// directory: numeric names, optionally with a `_next` or `_next_fail`
/// suffix.
pub fn filter_endpoint_dirs<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut dirs = names
        .into_iter()
        .filter(|name| parse_dir_id(name.as_ref()).is_some())
        .map(|name| name.as_ref().to_string())
        .collect::<Vec<_>>();
    dirs.sort();
    dirs
}

/// Picks one directory to restore per endpoint ID: the primary directory,
/// or its `_next` copy when the primary is missing. `_next_fail` copies are
/// never restored.
pub fn select_restore_dirs<S: AsRef<str>>(dirs: &[S]) -> Vec<(u16, String)> {
    let names = dirs.iter().map(|d| d.as_ref()).collect::<BTreeSet<_>>();
    let mut selected = BTreeMap::new();
    for name in &names {
        let Some((id, suffix)) = parse_dir_id(name) else {
            continue;
        };
        match suffix {
            "" => {
                selected.insert(id, name.to_string());
            }
            NEXT_SUFFIX if !names.contains(id.to_string().as_str()) => {
                selected.insert(id, name.to_string());
            }
            _ => {}
        }
    }
    selected.into_iter().collect()
}

fn parse_dir_id(name: &str) -> Option<(u16, &str)> {
    let (num, suffix) = match name.strip_suffix(NEXT_FAIL_SUFFIX) {
        Some(num) => (num, NEXT_FAIL_SUFFIX),
        None => match name.strip_suffix(NEXT_SUFFIX) {
            Some(num) => (num, NEXT_SUFFIX),
            None => (name, ""),
        },
    };
    if num.is_empty() || !num.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    num.parse().ok().map(|id| (id, suffix))
}

// === impl Endpoint ===

impl Endpoint {
    /// Rebuilds an endpoint from its persisted form. The endpoint starts in
    /// the `Restoring` state.
    pub fn restore(
        json: &[u8],
        deps: EndpointDeps,
        config: Arc<EndpointConfig>,
    ) -> Result<Arc<Self>, Error> {
        let s = serde_json::from_slice::<SerializedEndpoint>(json).map_err(Error::Restore)?;
        Ok(Self::from_serialized(s, deps, config))
    }

    /// Reads `<dir>/ep_config.json` and restores the endpoint it describes.
    pub async fn restore_from_dir(
        dir: &Path,
        deps: EndpointDeps,
        config: Arc<EndpointConfig>,
    ) -> Result<Arc<Self>, Error> {
        let json = tokio::fs::read(dir.join(ENDPOINT_CONFIG_FILE))
            .await
            .map_err(Error::Persist)?;
        Self::restore(&json, deps, config)
    }

    fn from_serialized(
        s: SerializedEndpoint,
        deps: EndpointDeps,
        config: Arc<EndpointConfig>,
    ) -> Arc<Self> {
        let SerializedEndpoint {
            id,
            if_name,
            container_name,
            ipv4,
            ipv6,
            k8s_namespace,
            k8s_pod_name,
            k8s_uid,
            labels,
            security_identity,
            mut options,
            dns_rules,
            dns_history,
            dns_zombies,
            datapath_configuration,
            no_track_port,
        } = s;

        let identity_labels = labels.identity_labels();
        let kind = if identity_labels.has_host_label() {
            EndpointKind::Host
        } else if identity_labels.has_ingress_label() {
            EndpointKind::Ingress
        } else {
            EndpointKind::Workload
        };

        let unknown = options.retain_known(&config.option_library);
        if !unknown.is_empty() {
            debug!(endpoint.id = id, ?unknown, "Dropped unknown options");
        }
        if config.keep_config {
            options.inherit(&config.default_options);
        } else {
            for (name, setting) in config.default_options.iter() {
                options.set(name, setting);
            }
        }

        let identity = match security_identity {
            Some(identity) if !identity.id.is_unknown() => Arc::new(identity),
            _ => {
                debug!(endpoint.id = id, "No valid identity restored; using init");
                Identity::init()
            }
        };

        let unregistered_identity = !identity.id.is_reserved();
        let inner = Inner {
            labels,
            identity: Some(identity),
            unregistered_identity,
            options,
            dns_rules,
            dns_history,
            dns_zombies,
            k8s_namespace,
            k8s_pod_name,
            k8s_uid,
            no_track_port,
            datapath_config: datapath_configuration,
            ..Default::default()
        };
        let ep = Self::assemble(
            kind,
            id,
            if_name,
            (ipv4, ipv6),
            container_name,
            inner,
            deps,
            config,
        );
        ep.unconditional_lock()
            .set_state(State::Restoring, "Endpoint restoring");
        ep
    }

    pub fn to_serialized(&self) -> SerializedEndpoint {
        self.serialize(&self.inner.read())
    }

    pub(crate) fn serialize(&self, inner: &Inner) -> SerializedEndpoint {
        SerializedEndpoint {
            id: self.id,
            if_name: self.if_name.clone(),
            container_name: self.container_name.clone(),
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            k8s_namespace: inner.k8s_namespace.clone(),
            k8s_pod_name: inner.k8s_pod_name.clone(),
            k8s_uid: inner.k8s_uid.clone(),
            labels: inner.labels.clone(),
            security_identity: inner.identity.as_deref().cloned(),
            options: inner.options.clone(),
            dns_rules: inner.dns_rules.clone(),
            dns_history: inner.dns_history.clone(),
            dns_zombies: inner.dns_zombies.clone(),
            datapath_configuration: inner.datapath_config.clone(),
            no_track_port: inner.no_track_port,
        }
    }

    /// Atomically replaces `<state_dir>/<id>/ep_config.json`.
    pub(crate) async fn write_state(&self, state: &SerializedEndpoint) -> Result<(), Error> {
        let dir = self.config.endpoint_dir(self.id);
        let json = serde_json::to_vec_pretty(state).map_err(|e| Error::Persist(e.into()))?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(Error::Persist)?;
        let tmp = dir.join(format!("{ENDPOINT_CONFIG_FILE}.tmp"));
        tokio::fs::write(&tmp, json).await.map_err(Error::Persist)?;
        tokio::fs::rename(&tmp, dir.join(ENDPOINT_CONFIG_FILE))
            .await
            .map_err(Error::Persist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn filters_endpoint_dirs() {
        let dirs = filter_endpoint_dirs([
            "12",
            "12_next",
            "7_next_fail",
            "lxc-state",
            "_next",
            "99999999",
            "3",
            "4_stale",
        ]);
        assert_eq!(dirs, vec!["12", "12_next", "3", "7_next_fail"]);
    }

    #[test]
    fn restore_prefers_primary_dirs() {
        let dirs = filter_endpoint_dirs(["12", "12_next", "7_next_fail", "9_next", "3"]);
        assert_eq!(
            select_restore_dirs(&dirs),
            vec![
                (3, "3".to_string()),
                (9, "9_next".to_string()),
                (12, "12".to_string()),
            ]
        );
    }

    #[test]
    fn corrupt_identity_is_dropped() {
        let json = r#"{
            "id": 4,
            "securityIdentity": {"id": "not-a-number"},
            "options": {"Debug": "enabled"}
        }"#;
        let s = serde_json::from_str::<SerializedEndpoint>(json).unwrap();
        assert_eq!(s.id, 4);
        assert_eq!(s.security_identity, None);
        assert!(s.options.is_enabled("Debug"));
    }
}
