#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use cluster_quota_controller_core as core;
pub use cluster_quota_controller_k8s_api as k8s;
pub use cluster_quota_controller_k8s_usage as usage;

mod admission;
mod args;
mod engine;
mod events;
mod locks;
mod metrics;
mod reservations;
mod validation;


pub use self::{
    admission::{Admission, Settings},
    args::Args,
    events::{EventSource, Recorder, Sweeper, EVENT_SOURCE_LABEL},
    metrics::AdmissionMetrics,
};
