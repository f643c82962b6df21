use endpoint_agent_core::labels::{Label, Labels};
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::collections::BTreeMap;

/// Splits orchestrator labels into identity-relevant labels and
/// informational ones.
///
/// A key is informational when it matches one of the exclusion patterns and
/// none of the inclusion patterns.
#[derive(Clone, Debug)]
pub struct LabelFilter {
    exclude: RegexSet,
    include: Option<Regex>,
}

static DEFAULT: Lazy<LabelFilter> = Lazy::new(|| {
    LabelFilter::new(
        [
            r"^pod-template-hash$",
            r"^controller-revision-hash$",
            r"^pod-template-generation$",
            r"^statefulset\.kubernetes\.io/pod-name$",
            r"^io\.kubernetes\.",
            r"^kubernetes\.io/",
            r"^beta\.kubernetes\.io/",
            r"^k8s\.io/",
        ],
        Some(r"^io\.kubernetes\.pod\.namespace$"),
    )
    .expect("default label filter must compile")
});

// === impl LabelFilter ===

impl Default for LabelFilter {
    fn default() -> Self {
        DEFAULT.clone()
    }
}

impl LabelFilter {
    pub fn new<I, S>(exclude: I, include: Option<&str>) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            exclude: RegexSet::new(exclude)?,
            include: include.map(Regex::new).transpose()?,
        })
    }

    pub fn is_identity_key(&self, key: &str) -> bool {
        if self.include.as_ref().is_some_and(|re| re.is_match(key)) {
            return true;
        }
        !self.exclude.is_match(key)
    }

    /// Returns `(identity, info)` labels, each tagged with `source`.
    pub fn split(&self, labels: &BTreeMap<String, String>, source: &str) -> (Labels, Labels) {
        let mut identity = Labels::new();
        let mut info = Labels::new();
        for (k, v) in labels {
            let label = Label::new(k.clone(), v.clone(), source);
            if self.is_identity_key(k) {
                identity.insert(label);
            } else {
                info.insert(label);
            }
        }
        (identity, info)
    }
}
