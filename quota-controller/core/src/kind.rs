use crate::ResourceName;
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

/// The closed set of object kinds the admission handler dispatches on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Pod,
    PersistentVolumeClaim,
    Service,
    Namespace,
    ClusterResourceQuota,
    ObjectCount(ObjectCountKind),
}

/// A generic kind whose usage is the number of objects of that kind in a
/// namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectCountKind {
    pub group: String,
    pub version: String,
    pub resource: String,
}

/// The object-count kinds configured for this process, keyed by
/// `(group, resource)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectCountKinds(BTreeMap<(String, String), ObjectCountKind>);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid object-count resource {0:?}: expected resource[.group][/version]")]
pub struct InvalidObjectCountKind(String);

// === impl Kind ===

impl Kind {
    /// A stable, low-cardinality label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::PersistentVolumeClaim => "persistentvolumeclaim",
            Self::Service => "service",
            Self::Namespace => "namespace",
            Self::ClusterResourceQuota => "clusterresourcequota",
            Self::ObjectCount(_) => "objectcount",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectCount(kind) => write!(f, "objectcount({})", kind.count_resource()),
            kind => f.write_str(kind.as_str()),
        }
    }
}

// === impl ObjectCountKind ===

impl ObjectCountKind {
    pub fn count_resource(&self) -> ResourceName {
        ResourceName::object_count(&self.resource, &self.group)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl FromStr for ObjectCountKind {
    type Err = InvalidObjectCountKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidObjectCountKind(s.to_string());
        let (gr, version) = s.split_once('/').unwrap_or((s, "v1"));
        let (resource, group) = gr.split_once('.').unwrap_or((gr, ""));
        let valid = |part: &str| {
            part.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        };
        if resource.is_empty() || version.is_empty() || !valid(resource) || !valid(group) {
            return Err(invalid());
        }
        if !version.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        })
    }
}

// === impl ObjectCountKinds ===

impl ObjectCountKinds {
    pub fn get(&self, group: &str, resource: &str) -> Option<&ObjectCountKind> {
        self.0.get(&(group.to_string(), resource.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectCountKind> {
        self.0.values()
    }
}

impl FromIterator<ObjectCountKind> for ObjectCountKinds {
    fn from_iter<T: IntoIterator<Item = ObjectCountKind>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|k| ((k.group.clone(), k.resource.clone()), k))
                .collect(),
        )
    }
}

impl FromStr for ObjectCountKinds {
    type Err = InvalidObjectCountKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<ObjectCountKind>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_count_kinds() {
        let kinds = "configmaps, deployments.apps/v1,widgets.example.com/v1beta1"
            .parse::<ObjectCountKinds>()
            .unwrap();

        let cm = kinds.get("", "configmaps").expect("configmaps must be tracked");
        assert_eq!(cm.api_version(), "v1");
        assert_eq!(cm.count_resource().as_str(), "count/configmaps");

        let deploy = kinds.get("apps", "deployments").expect("deployments must be tracked");
        assert_eq!(deploy.api_version(), "apps/v1");
        assert_eq!(deploy.count_resource().as_str(), "count/deployments.apps");

        let widgets = kinds
            .get("example.com", "widgets")
            .expect("widgets must be tracked");
        assert_eq!(widgets.version, "v1beta1");

        assert!(kinds.get("", "secrets").is_none());
    }

    #[test]
    fn rejects_malformed_object_count_kinds() {
        assert!("".parse::<ObjectCountKinds>().unwrap().iter().next().is_none());
        assert!("ConfigMaps".parse::<ObjectCountKinds>().is_err());
        assert!("configmaps/".parse::<ObjectCountKinds>().is_err());
        assert!(".apps".parse::<ObjectCountKinds>().is_err());
    }
}
