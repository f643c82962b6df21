/// The variety of network attachment an endpoint represents.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// A pod or container interface.
    Workload,
    /// The node's own network namespace.
    Host,
    /// The ingress proxy. It has no interface, programs or policy map.
    Ingress,
    /// A test endpoint that never touches host state.
    Fake,
}

/// Capabilities resolved once from the endpoint kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Properties {
    pub has_datapath: bool,
    pub has_policy_map: bool,
    pub at_host_ns: bool,
    pub skip_regeneration: bool,
    pub is_fake: bool,
}

impl EndpointKind {
    pub fn properties(&self) -> Properties {
        match self {
            Self::Workload | Self::Host => Properties {
                has_datapath: true,
                has_policy_map: true,
                at_host_ns: *self == Self::Host,
                skip_regeneration: false,
                is_fake: false,
            },
            Self::Ingress => Properties {
                has_datapath: false,
                has_policy_map: false,
                at_host_ns: true,
                skip_regeneration: true,
                is_fake: false,
            },
            Self::Fake => Properties {
                has_datapath: false,
                has_policy_map: false,
                at_host_ns: false,
                skip_regeneration: true,
                is_fake: true,
            },
        }
    }
}
