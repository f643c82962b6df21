use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

pub const DEBUG: &str = "Debug";
pub const DROP_NOTIFICATION: &str = "DropNotification";
pub const TRACE_NOTIFICATION: &str = "TraceNotification";
pub const POLICY_VERDICT_NOTIFICATION: &str = "PolicyVerdictNotification";
pub const POLICY_AUDIT_MODE: &str = "PolicyAuditMode";
pub const MONITOR_AGGREGATION: &str = "MonitorAggregationLevel";
pub const CONNTRACK_ACCOUNTING: &str = "ConntrackAccounting";

/// Options that may be toggled on endpoints with reserved labels.
pub const DEBUG_OPTIONS: [&str; 5] = [
    DEBUG,
    TRACE_NOTIFICATION,
    POLICY_VERDICT_NOTIFICATION,
    POLICY_AUDIT_MODE,
    MONITOR_AGGREGATION,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Whether a change requires the datapath program to be rebuilt.
    pub requires_datapath: bool,
}

/// The set of options an endpoint may carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionLibrary {
    specs: BTreeMap<&'static str, OptionSpec>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionSetting {
    Disabled,
    Enabled,
}

/// Per-endpoint option values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct IntOptions(BTreeMap<String, OptionSetting>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("unknown option {0}")]
    Unknown(String),

    #[error("invalid value {value:?} for option {name}")]
    InvalidValue { name: String, value: String },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    pub changed: usize,
    pub requires_datapath: bool,
}

// === impl OptionLibrary ===

impl Default for OptionLibrary {
    fn default() -> Self {
        Self::new([
            OptionSpec {
                name: DEBUG,
                description: "Enable debugging trace statements",
                requires_datapath: true,
            },
            OptionSpec {
                name: DROP_NOTIFICATION,
                description: "Enable drop notifications",
                requires_datapath: true,
            },
            OptionSpec {
                name: TRACE_NOTIFICATION,
                description: "Enable trace notifications",
                requires_datapath: true,
            },
            OptionSpec {
                name: POLICY_VERDICT_NOTIFICATION,
                description: "Enable policy verdict notifications",
                requires_datapath: true,
            },
            OptionSpec {
                name: POLICY_AUDIT_MODE,
                description: "Enable audit mode for policy enforcement",
                requires_datapath: true,
            },
            OptionSpec {
                name: MONITOR_AGGREGATION,
                description: "Aggregate monitor events",
                requires_datapath: false,
            },
            OptionSpec {
                name: CONNTRACK_ACCOUNTING,
                description: "Enable per flow conntrack statistics",
                requires_datapath: true,
            },
        ])
    }
}

impl OptionLibrary {
    pub fn new(specs: impl IntoIterator<Item = OptionSpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.name, s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Parses a user-supplied configuration map without touching any
    /// endpoint state.
    pub fn validate(
        &self,
        config: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, OptionSetting>, OptionError> {
        config
            .iter()
            .map(|(name, value)| {
                if !self.contains(name) {
                    return Err(OptionError::Unknown(name.clone()));
                }
                let setting = value.parse::<OptionSetting>().map_err(|()| OptionError::InvalidValue {
                    name: name.clone(),
                    value: value.clone(),
                })?;
                Ok((name.clone(), setting))
            })
            .collect()
    }
}

// === impl OptionSetting ===

impl FromStr for OptionSetting {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "on" | "enable" | "enabled" | "1" => Ok(Self::Enabled),
            "false" | "off" | "disable" | "disabled" | "0" => Ok(Self::Disabled),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OptionSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("enabled"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

// === impl IntOptions ===

impl IntOptions {
    pub fn get(&self, name: &str) -> OptionSetting {
        self.0.get(name).copied().unwrap_or(OptionSetting::Disabled)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name) == OptionSetting::Enabled
    }

    pub fn set(&mut self, name: impl Into<String>, setting: OptionSetting) {
        self.0.insert(name.into(), setting);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, OptionSetting)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Applies already validated settings.
    pub fn apply(
        &mut self,
        library: &OptionLibrary,
        changes: &BTreeMap<String, OptionSetting>,
    ) -> Applied {
        let mut applied = Applied::default();
        for (name, setting) in changes {
            if self.get(name) == *setting {
                continue;
            }
            self.0.insert(name.clone(), *setting);
            applied.changed += 1;
            if library.get(name).map(|s| s.requires_datapath).unwrap_or(true) {
                applied.requires_datapath = true;
            }
        }
        applied
    }

    /// Fills in defaults for options the endpoint does not set explicitly.
    pub fn inherit(&mut self, defaults: &IntOptions) {
        for (name, setting) in defaults.iter() {
            self.0.entry(name.to_string()).or_insert(setting);
        }
    }

    /// Drops options the library doesn't know about, returning their names.
    pub fn retain_known(&mut self, library: &OptionLibrary) -> Vec<String> {
        let unknown = self
            .0
            .keys()
            .filter(|k| !library.contains(k))
            .cloned()
            .collect::<Vec<_>>();
        for k in &unknown {
            self.0.remove(k);
        }
        unknown
    }
}

impl FromIterator<(String, OptionSetting)> for IntOptions {
    fn from_iter<T: IntoIterator<Item = (String, OptionSetting)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
