use crate::k8s::{quota::InvalidQuantity, ClusterResourceQuota};
use cluster_quota_controller_core::{Quantity, ResourceList, ResourceName};
use cluster_quota_controller_k8s_api::labels::SelectorError;
use regex::Regex;
use std::{collections::BTreeMap, sync::LazyLock};
use thiserror::Error;

const QUALIFIED_NAME_MAX_LEN: usize = 63;
const DNS_SUBDOMAIN_MAX_LEN: usize = 253;
const LABEL_VALUE_MAX_LEN: usize = 63;

const QUALIFIED_NAME_REGEX: &str = r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$";
const DNS_SUBDOMAIN_REGEX: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";
const LABEL_VALUE_REGEX: &str = r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$";

static QUALIFIED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(QUALIFIED_NAME_REGEX).expect("should compile"));
static DNS_SUBDOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DNS_SUBDOMAIN_REGEX).expect("should compile"));
static LABEL_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(LABEL_VALUE_REGEX).expect("should compile"));

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum QuotaError {
    /// Hard limits are keyed by resource names, which must be qualified
    /// names, e.g. `requests.cpu` or `count/deployments.apps`.
    #[error("resource name {0:?} is not a valid qualified name")]
    ResourceName(String),

    #[error(transparent)]
    Quantity(#[from] InvalidQuantity),

    #[error("hard limit for {resource} must not be negative: {value}")]
    Negative { resource: String, value: String },

    /// Two keys normalize to the same resource, e.g. `cpu` and
    /// `requests.cpu`.
    #[error("hard limits {first:?} and {second:?} both name {resource}")]
    Duplicate {
        resource: ResourceName,
        first: String,
        second: String,
    },

    #[error("invalid namespace selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("namespace selector label key {0:?} is not a valid qualified name")]
    LabelKey(String),

    #[error("namespace selector label value {0:?} is invalid")]
    LabelValue(String),
}

/// Validates the shape of a quota, returning its normalized hard limits.
pub(crate) fn validate_quota(quota: &ClusterResourceQuota) -> Result<ResourceList, QuotaError> {
    let mut seen = BTreeMap::<ResourceName, &str>::new();
    let mut limits = ResourceList::default();
    for (key, value) in quota.spec.hard.iter() {
        if !is_qualified_name(key) {
            return Err(QuotaError::ResourceName(key.clone()));
        }

        let name = ResourceName::new(key);
        if let Some(first) = seen.insert(name.clone(), key) {
            return Err(QuotaError::Duplicate {
                resource: name,
                first: first.to_string(),
                second: key.clone(),
            });
        }

        let limit = value
            .0
            .parse::<Quantity>()
            .map_err(|error| InvalidQuantity {
                resource: key.clone(),
                error,
            })?;
        if limit.is_negative() {
            return Err(QuotaError::Negative {
                resource: key.clone(),
                value: value.0.clone(),
            });
        }
        limits.insert(name, limit);
    }

    if let Some(selector) = quota.spec.namespace_selector.as_ref() {
        selector.validate()?;
        if let Some(key) = selector.keys().find(|k| !is_qualified_name(k)) {
            return Err(QuotaError::LabelKey(key.to_string()));
        }
        if let Some(value) = selector.values().find(|v| !is_label_value(v)) {
            return Err(QuotaError::LabelValue(value.to_string()));
        }
    }

    Ok(limits)
}

/// Validates a name of the form `[prefix/]name`, where the optional prefix is
/// a DNS subdomain.
pub(crate) fn is_qualified_name(s: &str) -> bool {
    let (prefix, name) = match s.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, s),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty()
            || prefix.len() > DNS_SUBDOMAIN_MAX_LEN
            || !DNS_SUBDOMAIN.is_match(prefix)
        {
            return false;
        }
    }
    name.len() <= QUALIFIED_NAME_MAX_LEN && QUALIFIED_NAME.is_match(name)
}

fn is_label_value(s: &str) -> bool {
    s.len() <= LABEL_VALUE_MAX_LEN && LABEL_VALUE.is_match(s)
}
