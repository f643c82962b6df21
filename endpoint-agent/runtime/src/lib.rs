#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod agent;
mod args;
mod dry_run;
mod duration;

pub use self::{
    agent::Agent,
    args::Args,
    dry_run::NoopDatapath,
    duration::{GoDuration, ParseError},
};
