use cluster_quota_controller_k8s_api::{
    ClusterResourceQuota, Labels, Namespace, ResourceExt, Selector,
};
use std::collections::BTreeSet;

/// The name and labels of a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: Labels,
}

/// Namespaces that no quota ever applies to.
#[derive(Clone, Debug, Default)]
pub struct Exclusions {
    label: Option<String>,
    namespaces: BTreeSet<String>,
}

/// Resolves which namespaces a quota applies to.
#[derive(Clone, Debug, Default)]
pub struct ScopeResolver {
    exclusions: Exclusions,
}

/// The namespaces a quota applies to, in name order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    selected: BTreeSet<String>,

    /// Namespaces the quota's status still accounts for that are no longer
    /// selected. Their usage is aggregated until the reconciler drops them.
    tracked: BTreeSet<String>,
}

// === impl NamespaceInfo ===

impl NamespaceInfo {
    pub fn new(name: impl ToString, labels: impl Into<Labels>) -> Self {
        Self {
            name: name.to_string(),
            labels: labels.into(),
        }
    }
}

impl From<&Namespace> for NamespaceInfo {
    fn from(ns: &Namespace) -> Self {
        Self::new(ns.name_any(), ns.metadata.labels.clone())
    }
}

// === impl Exclusions ===

impl Exclusions {
    pub fn new(label: Option<String>, namespaces: impl IntoIterator<Item = String>) -> Self {
        Self {
            label: label.filter(|l| !l.is_empty()),
            namespaces: namespaces.into_iter().collect(),
        }
    }

    pub fn excludes(&self, ns: &NamespaceInfo) -> bool {
        self.namespaces.contains(&ns.name)
            || self
                .label
                .as_deref()
                .is_some_and(|label| ns.labels.contains_key(label))
    }
}

// === impl ScopeResolver ===

impl ScopeResolver {
    pub fn new(exclusions: Exclusions) -> Self {
        Self { exclusions }
    }

    pub fn excludes(&self, ns: &NamespaceInfo) -> bool {
        self.exclusions.excludes(ns)
    }

    /// Whether a quota with the given selector applies to `ns`. An absent or
    /// empty selector selects every namespace that is not excluded.
    pub fn selects(&self, selector: Option<&Selector>, ns: &NamespaceInfo) -> bool {
        !self.excludes(ns) && selector.map_or(true, |s| s.matches(&ns.labels))
    }

    /// Resolves a quota's scope against the given namespace listing.
    pub fn resolve(&self, quota: &ClusterResourceQuota, namespaces: &[NamespaceInfo]) -> Scope {
        let selector = quota.spec.namespace_selector.as_ref();
        let selected = namespaces
            .iter()
            .filter(|ns| self.selects(selector, ns))
            .map(|ns| ns.name.clone())
            .collect::<BTreeSet<_>>();

        let recorded = quota.tracked_namespaces().collect::<BTreeSet<_>>();
        let tracked = namespaces
            .iter()
            .filter(|ns| recorded.contains(ns.name.as_str()))
            .filter(|ns| !self.excludes(ns) && !selected.contains(&ns.name))
            .map(|ns| ns.name.clone())
            .collect();

        Scope { selected, tracked }
    }
}

// === impl Scope ===

impl Scope {
    /// Selected namespaces, in name order.
    pub fn selected(&self) -> impl Iterator<Item = &str> {
        self.selected.iter().map(String::as_str)
    }

    /// Every namespace whose usage counts toward the quota, in name order.
    pub fn aggregated(&self) -> impl Iterator<Item = &str> {
        self.selected
            .union(&self.tracked)
            .map(String::as_str)
    }
}
