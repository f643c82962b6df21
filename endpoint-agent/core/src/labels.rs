use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

pub mod op;

pub use self::op::{LabelError, OpLabels};

pub const SOURCE_ANY: &str = "any";
pub const SOURCE_K8S: &str = "k8s";
pub const SOURCE_CONTAINER: &str = "container";
pub const SOURCE_CNI: &str = "cni";
pub const SOURCE_RESERVED: &str = "reserved";
pub const SOURCE_CIDR: &str = "cidr";
pub const SOURCE_UNSPEC: &str = "unspec";
pub const SOURCE_NODE: &str = "node";
pub const SOURCE_FQDN: &str = "fqdn";

pub const ID_NAME_HOST: &str = "host";
pub const ID_NAME_WORLD: &str = "world";
pub const ID_NAME_HEALTH: &str = "health";
pub const ID_NAME_INIT: &str = "init";
pub const ID_NAME_INGRESS: &str = "ingress";
pub const ID_NAME_REMOTE_NODE: &str = "remote-node";
pub const ID_NAME_KUBE_APISERVER: &str = "kube-apiserver";
pub const ID_NAME_UNMANAGED: &str = "unmanaged";

/// A single `source:key=value` label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Label {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub source: String,
}

/// A set of labels, keyed by label key.
///
/// Two labels with the same key but different sources can't coexist in a
/// set; the most recent insert wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, Label>);

// === impl Label ===

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source: source.into(),
        }
    }

    pub fn reserved(name: &str) -> Self {
        Self::new(name, "", SOURCE_RESERVED)
    }

    /// Parses `source:key=value`.
    ///
    /// A leading `$` is shorthand for the reserved source, and a label without
    /// a source is `unspec`.
    pub fn parse(s: &str) -> Self {
        let (source, rest) = match s.strip_prefix('$') {
            Some(rest) => (SOURCE_RESERVED, rest),
            None => match s.split_once(':') {
                Some((source, rest)) if !source.is_empty() => (source, rest),
                Some((_, rest)) => (SOURCE_UNSPEC, rest),
                None => (SOURCE_UNSPEC, s),
            },
        };

        match rest.split_once('=') {
            // `reserved:=foo` is how the reserved source writes a key-less label.
            Some(("", value)) if source == SOURCE_RESERVED => Self::new(value, "", source),
            Some((key, value)) => Self::new(key, value, source),
            None => Self::new(rest, "", source),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.source == SOURCE_RESERVED
    }

    pub fn is_any_source(&self) -> bool {
        self.source == SOURCE_ANY
    }

    /// Returns true if `self` matches `target`. An `any` source on `self`
    /// matches every source.
    pub fn matches(&self, target: &Label) -> bool {
        (self.is_any_source() || self.source == target.source)
            && self.key == target.key
            && self.value == target.value
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.source, self.key)
        } else {
            write!(f, "{}:{}={}", self.source, self.key, self.value)
        }
    }
}

// === impl Labels ===

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserved(name: &str) -> Self {
        std::iter::once(Label::reserved(name)).collect()
    }

    pub fn init() -> Self {
        Self::reserved(ID_NAME_INIT)
    }

    pub fn host() -> Self {
        Self::reserved(ID_NAME_HOST)
    }

    pub fn ingress() -> Self {
        Self::reserved(ID_NAME_INGRESS)
    }

    /// Builds a label set from a plain key/value map, tagging every entry
    /// with `source`.
    pub fn from_map<'a, I>(map: I, source: &str) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        map.into_iter()
            .map(|(k, v)| Label::new(k.clone(), v.clone(), source))
            .collect()
    }

    pub fn parse_all<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        labels.into_iter().map(Label::parse).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Label> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, label: Label) -> Option<Label> {
        self.0.insert(label.key.clone(), label)
    }

    pub fn remove(&mut self, key: &str) -> Option<Label> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn retain(&mut self, mut f: impl FnMut(&Label) -> bool) {
        self.0.retain(|_, l| f(l));
    }

    /// Copies every label from `other` into `self`, overwriting on key
    /// collision.
    pub fn merge(&mut self, other: &Labels) {
        for l in other.iter() {
            self.insert(l.clone());
        }
    }

    pub fn get_from_source(&self, source: &str) -> Labels {
        self.iter()
            .filter(|l| l.source == source)
            .cloned()
            .collect()
    }

    pub fn remove_from_source(&mut self, source: &str) {
        self.retain(|l| l.source != source);
    }

    pub fn has_label(&self, label: &Label) -> bool {
        self.iter().any(|l| label.matches(l))
    }

    pub fn has_reserved(&self, name: &str) -> bool {
        self.get(name).map(Label::is_reserved).unwrap_or(false)
    }

    pub fn has_init_label(&self) -> bool {
        self.has_reserved(ID_NAME_INIT)
    }

    pub fn has_host_label(&self) -> bool {
        self.has_reserved(ID_NAME_HOST)
    }

    pub fn has_ingress_label(&self) -> bool {
        self.has_reserved(ID_NAME_INGRESS)
    }

    /// Returns true if the set is non-empty and every label is reserved.
    pub fn is_reserved(&self) -> bool {
        !self.is_empty() && self.iter().all(Label::is_reserved)
    }

    /// Returns the reserved labels in the set.
    pub fn find_reserved(&self) -> Labels {
        self.get_from_source(SOURCE_RESERVED)
    }

    /// A canonical, sorted `;`-joined rendering used as the allocator key.
    pub fn sorted_list(&self) -> String {
        let mut out = String::new();
        for l in self.iter() {
            out.push_str(&l.source);
            out.push(':');
            out.push_str(&l.key);
            out.push('=');
            out.push_str(&l.value);
            out.push(';');
        }
        out
    }

    pub fn to_model(&self) -> Vec<String> {
        self.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for l in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            l.fmt(f)?;
        }
        Ok(())
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        let mut labels = Self::default();
        for l in iter {
            labels.insert(l);
        }
        labels
    }
}

impl IntoIterator for Labels {
    type Item = Label;
    type IntoIter = std::collections::btree_map::IntoValues<String, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::collections::btree_map::Values<'a, String, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.values()
    }
}
