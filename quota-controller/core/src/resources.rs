use crate::Quantity;
use std::{borrow::Borrow, collections::BTreeMap, fmt};

/// Compute resources that may be named either bare or with a `requests.`
/// prefix. Both spellings denote the same quota resource.
const REQUEST_ALIASES: [&str; 3] = ["cpu", "memory", "ephemeral-storage"];

pub const PODS: &str = "pods";
pub const SERVICES: &str = "services";
pub const SERVICES_LOAD_BALANCERS: &str = "services.loadbalancers";
pub const SERVICES_NODE_PORTS: &str = "services.nodeports";
pub const PERSISTENT_VOLUME_CLAIMS: &str = "persistentvolumeclaims";
pub const REQUESTS_STORAGE: &str = "requests.storage";

const STORAGE_CLASS_SUFFIX: &str = ".storageclass.storage.k8s.io/";

/// A canonical quota resource name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceName(String);

/// A set of resource quantities keyed by canonical name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceList(BTreeMap<ResourceName, Quantity>);

// === impl ResourceName ===

impl ResourceName {
    /// Normalizes `name` so that aliases compare equal.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        if REQUEST_ALIASES.contains(&name) {
            return Self(format!("requests.{name}"));
        }
        Self(name.to_string())
    }

    pub fn requests(resource: &str) -> Self {
        Self(format!("requests.{resource}"))
    }

    pub fn limits(resource: &str) -> Self {
        Self(format!("limits.{resource}"))
    }

    /// The object-count resource for a kind, e.g. `count/configmaps` or
    /// `count/deployments.apps`.
    pub fn object_count(resource: &str, group: &str) -> Self {
        if group.is_empty() {
            Self(format!("count/{resource}"))
        } else {
            Self(format!("count/{resource}.{group}"))
        }
    }

    pub fn storage_class(class: &str, resource: &str) -> Self {
        Self(format!("{class}{STORAGE_CLASS_SUFFIX}{resource}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ResourceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl Borrow<str> for ResourceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// === impl ResourceList ===

impl ResourceList {
    pub fn get(&self, name: &ResourceName) -> Quantity {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn contains(&self, name: &ResourceName) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Adds `quantity` to the named resource.
    pub fn add(&mut self, name: ResourceName, quantity: Quantity) {
        *self.0.entry(name).or_default() += quantity;
    }

    /// Sets the named resource, replacing any prior value.
    pub fn insert(&mut self, name: ResourceName, quantity: Quantity) {
        self.0.insert(name, quantity);
    }

    pub fn add_all(&mut self, other: &ResourceList) {
        for (name, quantity) in other.iter() {
            self.add(name.clone(), *quantity);
        }
    }

    /// Returns the per-resource increase from `old` to `self`, omitting
    /// resources that did not grow.
    pub fn increase_from(&self, old: &ResourceList) -> ResourceList {
        self.iter()
            .filter_map(|(name, new)| {
                let grown = new.saturating_sub_to_zero(old.get(name));
                (!grown.is_zero()).then(|| (name.clone(), grown))
            })
            .collect()
    }

    /// Keeps only the resources named in `names`.
    pub fn restrict<'n>(&self, names: impl IntoIterator<Item = &'n ResourceName>) -> ResourceList {
        names
            .into_iter()
            .filter_map(|name| self.0.get(name).map(|q| (name.clone(), *q)))
            .collect()
    }

    /// Drops zero quantities.
    pub fn non_zero(self) -> ResourceList {
        self.into_iter().filter(|(_, q)| !q.is_zero()).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &ResourceName> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceName, &Quantity)> {
        self.0.iter()
    }
}

impl FromIterator<(ResourceName, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (ResourceName, Quantity)>>(iter: T) -> Self {
        let mut list = Self::default();
        for (name, quantity) in iter {
            list.add(name, quantity);
        }
        list
    }
}

impl FromIterator<(&'static str, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (&'static str, Quantity)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(name, q)| (ResourceName::new(name), q))
            .collect()
    }
}

impl IntoIterator for ResourceList {
    type Item = (ResourceName, Quantity);
    type IntoIter = std::collections::btree_map::IntoIter<ResourceName, Quantity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, quantity) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{name}={quantity}")?;
        }
        Ok(())
    }
}
