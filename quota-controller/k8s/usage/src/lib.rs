#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod aggregate;
mod cluster;
pub mod extract;
mod scope;


pub use self::{
    aggregate::{Aggregator, Source, UsageSnapshot},
    cluster::{ClusterState, KubeCluster},
    extract::{ExtractError, Extractor},
    scope::{Exclusions, NamespaceInfo, Scope, ScopeResolver},
};
