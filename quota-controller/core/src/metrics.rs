use crate::{Outcome, Reason, ResourceList};
use std::time::Duration;

/// Receives the observations made while admitting requests.
///
/// The sink is constructed by the process and handed to each component that
/// reports, so that tests can substitute a recording implementation.
pub trait MetricsSink: Send + Sync + 'static {
    /// Records one completed admission call.
    fn admission(&self, kind: &'static str, operation: &'static str, outcome: Outcome, elapsed: Duration);

    /// Records an admission call that did not end in `Allowed`.
    fn error(&self, reason: Reason);

    /// Records the time taken to aggregate usage for a quota.
    fn aggregation(&self, quota: &str, elapsed: Duration);

    fn namespace_usage(&self, quota: &str, namespace: &str, usage: &ResourceList);

    fn total_usage(&self, quota: &str, usage: &ResourceList);
}
