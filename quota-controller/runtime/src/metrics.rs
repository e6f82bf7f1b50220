use cluster_quota_controller_core::{MetricsSink, Outcome, Reason, ResourceList};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::{sync::atomic::AtomicU64, time::Duration};

/// Reports admission observations to a prometheus registry.
#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    decisions: Family<DecisionLabels, Counter>,
    durations: Family<DurationLabels, Histogram>,
    errors: Family<ErrorLabels, Counter>,
    namespace_usage: Family<NamespaceUsageLabels, Gauge<f64, AtomicU64>>,
    total_usage: Family<UsageLabels, Gauge<f64, AtomicU64>>,
    aggregations: Family<QuotaLabels, Histogram>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DecisionLabels {
    kind: &'static str,
    operation: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DurationLabels {
    kind: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    reason: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespaceUsageLabels {
    quota: String,
    namespace: String,
    resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UsageLabels {
    quota: String,
    resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct QuotaLabels {
    quota: String,
}

// Admission calls are bounded by the admission timeout, which defaults to 8s.
const DURATION_BUCKETS: [f64; 9] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0, 2.5, 10.0];

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let decisions = Family::default();
        reg.register(
            "admission_decisions",
            "Count of admission decisions by kind, operation, and outcome",
            decisions.clone(),
        );

        let durations = Family::<DurationLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(DURATION_BUCKETS)
        });
        reg.register_with_unit(
            "admission_duration",
            "Histogram of admission call latency",
            Unit::Seconds,
            durations.clone(),
        );

        let errors = Family::default();
        reg.register(
            "admission_errors",
            "Count of admission calls that were not allowed, by reason",
            errors.clone(),
        );

        let namespace_usage = Family::default();
        reg.register(
            "namespace_usage",
            "Usage of a quota resource in one namespace, as last aggregated",
            namespace_usage.clone(),
        );

        let total_usage = Family::default();
        reg.register(
            "total_usage",
            "Usage of a quota resource across the quota's scope, as last aggregated",
            total_usage.clone(),
        );

        let aggregations = Family::<QuotaLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(DURATION_BUCKETS)
        });
        reg.register_with_unit(
            "aggregation_duration",
            "Histogram of the time taken to aggregate a quota's usage",
            Unit::Seconds,
            aggregations.clone(),
        );

        Self {
            decisions,
            durations,
            errors,
            namespace_usage,
            total_usage,
            aggregations,
        }
    }
}

impl MetricsSink for AdmissionMetrics {
    fn admission(
        &self,
        kind: &'static str,
        operation: &'static str,
        outcome: Outcome,
        elapsed: Duration,
    ) {
        let outcome = outcome.as_str();
        self.decisions
            .get_or_create(&DecisionLabels {
                kind,
                operation,
                outcome,
            })
            .inc();
        self.durations
            .get_or_create(&DurationLabels { kind, outcome })
            .observe(elapsed.as_secs_f64());
    }

    fn error(&self, reason: Reason) {
        self.errors
            .get_or_create(&ErrorLabels {
                reason: reason.as_str(),
            })
            .inc();
    }

    fn aggregation(&self, quota: &str, elapsed: Duration) {
        self.aggregations
            .get_or_create(&QuotaLabels {
                quota: quota.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    fn namespace_usage(&self, quota: &str, namespace: &str, usage: &ResourceList) {
        for (resource, quantity) in usage.iter() {
            self.namespace_usage
                .get_or_create(&NamespaceUsageLabels {
                    quota: quota.to_string(),
                    namespace: namespace.to_string(),
                    resource: resource.to_string(),
                })
                .set(quantity.as_f64());
        }
    }

    fn total_usage(&self, quota: &str, usage: &ResourceList) {
        for (resource, quantity) in usage.iter() {
            self.total_usage
                .get_or_create(&UsageLabels {
                    quota: quota.to_string(),
                    resource: resource.to_string(),
                })
                .set(quantity.as_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_quota_controller_core::Quantity;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn encodes_families() {
        let mut prom = Registry::default();
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("cluster_quota"));

        metrics.admission("pod", "CREATE", Outcome::Denied, Duration::from_millis(3));
        metrics.error(Reason::QuotaExceeded);
        metrics.aggregation("team-a", Duration::from_millis(1));
        let usage = [("cpu", Quantity::from_units(3))]
            .into_iter()
            .collect::<ResourceList>();
        metrics.total_usage("team-a", &usage);
        metrics.namespace_usage("team-a", "ns-a", &usage);

        let mut text = String::new();
        encode(&mut text, &prom).unwrap();
        assert!(text.contains(
            r#"cluster_quota_admission_decisions_total{kind="pod",operation="CREATE",outcome="denied"} 1"#
        ));
        assert!(text.contains(r#"cluster_quota_admission_errors_total{reason="quota_exceeded"} 1"#));
        assert!(text.contains(
            r#"cluster_quota_total_usage{quota="team-a",resource="requests.cpu"} 3"#
        ));
        assert!(text.contains(
            r#"cluster_quota_namespace_usage{quota="team-a",namespace="ns-a",resource="requests.cpu"} 3"#
        ));
        assert!(text.contains("cluster_quota_admission_duration_seconds_count"));
        assert!(text.contains("cluster_quota_aggregation_duration_seconds_count"));
    }
}
