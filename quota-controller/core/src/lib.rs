#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod decision;
mod error;
pub mod kind;
pub mod metrics;
mod quantity;
pub mod resources;

pub use self::{
    decision::{AdmissionDecision, Exceeded, Outcome, Reason},
    error::Error,
    kind::{Kind, ObjectCountKind, ObjectCountKinds},
    metrics::MetricsSink,
    quantity::{Quantity, QuantityError},
    resources::{ResourceList, ResourceName},
};
