#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod datapath;
pub mod dns;
pub mod identity;
pub mod labels;
pub mod metadata;
pub mod options;
pub mod policy;
pub mod proxy;
mod regeneration;

pub use self::{
    identity::{Identity, IdentityAllocator, LocalAllocator, NumericIdentity},
    labels::{Label, Labels, OpLabels},
    regeneration::{RegenerationLevel, RegenerationMetadata},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
