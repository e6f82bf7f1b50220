use crate::labels::Selector;
use cluster_quota_controller_core::{Quantity, QuantityError, ResourceList, ResourceName};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as Value;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const QUOTA_API_GROUP: &str = "clusterquota.io";

/// Limits the aggregate usage of a set of namespaces.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clusterquota.io",
    version = "v1alpha1",
    kind = "ClusterResourceQuota",
    status = "ClusterResourceQuotaStatus",
    shortname = "crq",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceQuotaSpec {
    /// Selects the namespaces this quota applies to. When absent, every
    /// namespace that is not globally excluded is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<Selector>,

    #[serde(default)]
    pub hard: BTreeMap<String, Value>,
}

/// Usage as last aggregated by the reconciler.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResourceQuotaStatus {
    #[serde(default)]
    pub total: UsageStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<NamespaceUsage>,

    /// RFC 3339 time at which `total` and `namespaces` were computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UsageStatus {
    #[serde(default)]
    pub hard: BTreeMap<String, Value>,

    #[serde(default)]
    pub used: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct NamespaceUsage {
    pub namespace: String,

    #[serde(default)]
    pub used: BTreeMap<String, Value>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid quantity for {resource}: {error}")]
pub struct InvalidQuantity {
    pub resource: String,
    #[source]
    pub error: QuantityError,
}

// === impl ClusterResourceQuota ===

impl ClusterResourceQuota {
    /// Parses the hard limits, keyed by canonical resource name.
    ///
    /// Should two keys name the same resource, the lower limit applies.
    pub fn hard_limits(&self) -> Result<ResourceList, InvalidQuantity> {
        let mut limits = ResourceList::default();
        for (name, value) in parse_all(&self.spec.hard) {
            let (name, limit) = value?;
            if !limits.contains(&name) || limit < limits.get(&name) {
                limits.insert(name, limit);
            }
        }
        Ok(limits)
    }

    /// Names of the namespaces recorded in the quota's status.
    pub fn tracked_namespaces(&self) -> impl Iterator<Item = &str> {
        self.status
            .iter()
            .flat_map(|s| s.namespaces.iter())
            .map(|ns| ns.namespace.as_str())
    }

    pub fn last_sync_time(&self) -> Option<&str> {
        self.status.as_ref()?.last_sync_time.as_deref()
    }

    /// Parses the aggregated usage recorded in the quota's status.
    pub fn status_used(&self) -> Result<Option<ResourceList>, InvalidQuantity> {
        match self.status.as_ref() {
            Some(status) => parse_list(&status.total.used).map(Some),
            None => Ok(None),
        }
    }

    /// Parses the usage recorded for a single namespace in the quota's status.
    pub fn status_namespace_used(&self, ns: &str) -> Result<Option<ResourceList>, InvalidQuantity> {
        match self
            .status
            .iter()
            .flat_map(|s| s.namespaces.iter())
            .find(|u| u.namespace == ns)
        {
            Some(usage) => parse_list(&usage.used).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_all(
    values: &BTreeMap<String, Value>,
) -> impl Iterator<Item = (&String, Result<(ResourceName, Quantity), InvalidQuantity>)> {
    values.iter().map(|(name, Value(value))| {
        let parsed = value
            .parse::<Quantity>()
            .map(|q| (ResourceName::new(name), q))
            .map_err(|error| InvalidQuantity {
                resource: name.clone(),
                error,
            });
        (name, parsed)
    })
}

fn parse_list(values: &BTreeMap<String, Value>) -> Result<ResourceList, InvalidQuantity> {
    parse_all(values).map(|(_, parsed)| parsed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn quota(hard: BTreeMap<String, Value>) -> ClusterResourceQuota {
        ClusterResourceQuota::new(
            "q",
            ClusterResourceQuotaSpec {
                namespace_selector: None,
                hard,
            },
        )
    }

    #[test]
    fn hard_limits_are_normalized() {
        let q = quota(btreemap! {
            "cpu".to_string() => Value("4".to_string()),
            "count/secrets".to_string() => Value("10".to_string()),
        });
        let limits = q.hard_limits().unwrap();
        assert_eq!(
            limits.get(&ResourceName::new("requests.cpu")),
            Quantity::from_units(4)
        );
        assert_eq!(
            limits.get(&ResourceName::new("count/secrets")),
            Quantity::from_units(10)
        );
    }

    #[test]
    fn aliased_limits_keep_the_lower_value() {
        let q = quota(btreemap! {
            "cpu".to_string() => Value("4".to_string()),
            "requests.cpu".to_string() => Value("2".to_string()),
        });
        assert_eq!(
            q.hard_limits().unwrap().get(&ResourceName::new("cpu")),
            Quantity::from_units(2)
        );
    }

    #[test]
    fn invalid_limits_name_the_resource() {
        let q = quota(btreemap! {
            "memory".to_string() => Value("lots".to_string()),
        });
        let err = q.hard_limits().unwrap_err();
        assert_eq!(err.resource, "memory");
    }

    #[test]
    fn reads_status() {
        let mut q = quota(BTreeMap::new());
        assert_eq!(q.status_used(), Ok(None));

        q.status = Some(ClusterResourceQuotaStatus {
            total: UsageStatus {
                hard: BTreeMap::new(),
                used: btreemap! { "cpu".to_string() => Value("3".to_string()) },
            },
            namespaces: vec![
                NamespaceUsage {
                    namespace: "ns-a".to_string(),
                    used: btreemap! { "cpu".to_string() => Value("2".to_string()) },
                },
                NamespaceUsage {
                    namespace: "ns-b".to_string(),
                    used: btreemap! { "cpu".to_string() => Value("1".to_string()) },
                },
            ],
            last_sync_time: Some("2024-01-01T00:00:00Z".to_string()),
        });

        assert_eq!(q.tracked_namespaces().collect::<Vec<_>>(), vec!["ns-a", "ns-b"]);
        assert_eq!(
            q.status_used()
                .unwrap()
                .unwrap()
                .get(&ResourceName::new("cpu")),
            Quantity::from_units(3)
        );
        assert_eq!(
            q.status_namespace_used("ns-b")
                .unwrap()
                .unwrap()
                .get(&ResourceName::new("cpu")),
            Quantity::from_units(1)
        );
        assert_eq!(q.status_namespace_used("ns-c"), Ok(None));
        assert_eq!(q.last_sync_time(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn deserializes_quota_object() {
        let q: ClusterResourceQuota = serde_json::from_value(serde_json::json!({
            "apiVersion": "clusterquota.io/v1alpha1",
            "kind": "ClusterResourceQuota",
            "metadata": { "name": "team-a" },
            "spec": {
                "namespaceSelector": { "matchLabels": { "team": "a" } },
                "hard": { "cpu": "4", "memory": "8Gi" },
            },
        }))
        .unwrap();
        assert_eq!(q.spec.hard.len(), 2);
        assert!(q.spec.namespace_selector.is_some());
        assert!(q.status.is_none());
    }
}
