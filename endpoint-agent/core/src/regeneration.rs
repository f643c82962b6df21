use std::fmt;

/// How much of an endpoint a regeneration must rebuild. Ordered, so that
/// coalesced requests rebuild at the highest requested level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegenerationLevel {
    #[default]
    Invalid,
    /// Recompute policy and update maps and proxy state only.
    WithoutDatapath,
    /// Also recompile and reattach the datapath program.
    WithDatapath,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegenerationMetadata {
    pub reason: String,
    pub level: RegenerationLevel,
}

impl RegenerationMetadata {
    pub fn new(reason: impl Into<String>, level: RegenerationLevel) -> Self {
        Self {
            reason: reason.into(),
            level,
        }
    }
}

impl fmt::Display for RegenerationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("invalid"),
            Self::WithoutDatapath => f.write_str("without-datapath"),
            Self::WithDatapath => f.write_str("with-datapath"),
        }
    }
}
