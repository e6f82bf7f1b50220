use cluster_quota_controller_core::{
    resources::{
        PERSISTENT_VOLUME_CLAIMS, PODS, REQUESTS_STORAGE, SERVICES, SERVICES_LOAD_BALANCERS,
        SERVICES_NODE_PORTS,
    },
    ObjectCountKind, Quantity, QuantityError, ResourceList, ResourceName,
};
use cluster_quota_controller_k8s_api::{
    api::core::v1::Container, PersistentVolumeClaim, Pod, Quantity as Value, Service,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Compute resources always summed from pod requests and limits.
const COMPUTE_RESOURCES: [&str; 3] = ["cpu", "memory", "ephemeral-storage"];

const TERMINAL_POD_PHASES: [&str; 2] = ["Succeeded", "Failed"];

/// Maps workload objects to the quota resources they consume.
#[derive(Clone, Debug, Default)]
pub struct Extractor {
    tracked: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("object has no spec")]
    MissingSpec,

    #[error("persistent volume claim does not request storage")]
    MissingStorageRequest,

    #[error("invalid quantity for {resource}: {error}")]
    InvalidQuantity {
        resource: String,
        #[source]
        error: QuantityError,
    },
}

// === impl Extractor ===

impl Extractor {
    /// Creates an extractor that also sums the given extended resources
    /// (e.g. `nvidia.com/gpu`) from pod requests and limits.
    pub fn new(tracked: impl IntoIterator<Item = String>) -> Self {
        let mut tracked = tracked
            .into_iter()
            .filter(|r| !r.is_empty() && !COMPUTE_RESOURCES.contains(&r.as_str()))
            .collect::<Vec<_>>();
        tracked.sort();
        tracked.dedup();
        Self { tracked }
    }

    /// The resources a pod adds to its namespace when it is created.
    ///
    /// Requests and limits are summed over regular and init containers, each
    /// container counted once. A container without an explicit request adds
    /// nothing; requests are never inferred from limits.
    pub fn pod(&self, pod: &Pod) -> Result<ResourceList, ExtractError> {
        let spec = pod.spec.as_ref().ok_or(ExtractError::MissingSpec)?;
        let containers = spec
            .containers
            .iter()
            .chain(spec.init_containers.iter().flatten());

        let mut usage = ResourceList::default();
        for container in containers {
            self.add_container(&mut usage, container)?;
        }

        let mut usage = usage.non_zero();
        usage.add(PODS.into(), Quantity::from_units(1));
        usage.add(ResourceName::object_count("pods", ""), Quantity::from_units(1));
        Ok(usage)
    }

    /// The resources a running pod currently holds. Pods that have reached a
    /// terminal phase hold nothing.
    pub fn pod_usage(&self, pod: &Pod) -> Result<ResourceList, ExtractError> {
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase.is_some_and(|p| TERMINAL_POD_PHASES.contains(&p)) {
            return Ok(ResourceList::default());
        }
        self.pod(pod)
    }

    pub fn persistent_volume_claim(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<ResourceList, ExtractError> {
        let spec = pvc.spec.as_ref().ok_or(ExtractError::MissingSpec)?;
        let storage = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .ok_or(ExtractError::MissingStorageRequest)?;
        let storage = parse(REQUESTS_STORAGE, storage)?;

        let one = Quantity::from_units(1);
        let mut usage = ResourceList::default();
        usage.add(REQUESTS_STORAGE.into(), storage);
        usage.add(PERSISTENT_VOLUME_CLAIMS.into(), one);
        usage.add(
            ResourceName::object_count(PERSISTENT_VOLUME_CLAIMS, ""),
            one,
        );
        if let Some(class) = spec.storage_class_name.as_deref().filter(|c| !c.is_empty()) {
            usage.add(
                ResourceName::storage_class(class, REQUESTS_STORAGE),
                storage,
            );
            usage.add(
                ResourceName::storage_class(class, PERSISTENT_VOLUME_CLAIMS),
                one,
            );
        }
        Ok(usage)
    }

    pub fn service(&self, svc: &Service) -> Result<ResourceList, ExtractError> {
        let spec = svc.spec.as_ref().ok_or(ExtractError::MissingSpec)?;

        let one = Quantity::from_units(1);
        let mut usage = ResourceList::default();
        usage.add(SERVICES.into(), one);
        usage.add(ResourceName::object_count(SERVICES, ""), one);

        let ports = spec.ports.as_ref().map_or(0, Vec::len) as i64;
        match spec.type_.as_deref() {
            Some("LoadBalancer") => {
                usage.add(SERVICES_LOAD_BALANCERS.into(), one);
                if spec.allocate_load_balancer_node_ports != Some(false) && ports > 0 {
                    usage.add(SERVICES_NODE_PORTS.into(), Quantity::from_units(ports));
                }
            }
            Some("NodePort") if ports > 0 => {
                usage.add(SERVICES_NODE_PORTS.into(), Quantity::from_units(ports));
            }
            _ => {}
        }
        Ok(usage)
    }

    pub fn object_count(&self, kind: &ObjectCountKind) -> ResourceList {
        let mut usage = ResourceList::default();
        usage.add(kind.count_resource(), Quantity::from_units(1));
        usage
    }

    fn add_container(
        &self,
        usage: &mut ResourceList,
        container: &Container,
    ) -> Result<(), ExtractError> {
        let Some(resources) = container.resources.as_ref() else {
            return Ok(());
        };

        let names = COMPUTE_RESOURCES
            .iter()
            .copied()
            .chain(self.tracked.iter().map(String::as_str));
        for name in names {
            if let Some(value) = lookup(resources.requests.as_ref(), name) {
                usage.add(ResourceName::requests(name), parse(name, value)?);
            }
            if let Some(value) = lookup(resources.limits.as_ref(), name) {
                usage.add(ResourceName::limits(name), parse(name, value)?);
            }
        }
        Ok(())
    }
}

fn lookup<'v>(values: Option<&'v BTreeMap<String, Value>>, name: &str) -> Option<&'v Value> {
    values?.get(name)
}

fn parse(resource: &str, Value(value): &Value) -> Result<Quantity, ExtractError> {
    value
        .parse()
        .map_err(|error| ExtractError::InvalidQuantity {
            resource: resource.to_string(),
            error,
        })
}

// === resource categories ===

/// Whether pods contribute to the named resource.
pub fn is_pod_resource(name: &ResourceName) -> bool {
    let name = name.as_str();
    name == PODS
        || name == "count/pods"
        || name.starts_with("limits.")
        || (name.starts_with("requests.") && name != REQUESTS_STORAGE)
}

/// Whether persistent volume claims contribute to the named resource.
pub fn is_claim_resource(name: &ResourceName) -> bool {
    let name = name.as_str();
    name == REQUESTS_STORAGE
        || name == PERSISTENT_VOLUME_CLAIMS
        || name == "count/persistentvolumeclaims"
        || name.contains(".storageclass.storage.k8s.io/")
}

/// Whether services contribute to the named resource.
pub fn is_service_resource(name: &ResourceName) -> bool {
    let name = name.as_str();
    name == SERVICES || name.starts_with("services.") || name == "count/services"
}
