use crate::{
    extract::{is_claim_resource, is_pod_resource, is_service_resource, ExtractError},
    Extractor, NamespaceInfo,
};
use anyhow::Result;
use cluster_quota_controller_core::{ObjectCountKinds, Quantity, ResourceList, ResourceName};
use cluster_quota_controller_k8s_api::{
    Api, Client, ClusterResourceQuota, ListParams, Namespace, PersistentVolumeClaim, Pod, Service,
};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Read access to the cluster state that admission decisions depend on.
#[async_trait::async_trait]
pub trait ClusterState: Send + Sync + 'static {
    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>>;

    async fn quotas(&self) -> Result<Vec<ClusterResourceQuota>>;

    /// Sums the live usage of `resources` in a single namespace.
    async fn namespace_usage(
        &self,
        namespace: &str,
        resources: &BTreeSet<ResourceName>,
    ) -> Result<ResourceList>;
}

/// Reads cluster state from the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    extractor: Extractor,
    object_counts: ObjectCountKinds,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: Client, extractor: Extractor, object_counts: ObjectCountKinds) -> Self {
        Self {
            client,
            extractor,
            object_counts,
        }
    }

    async fn sum<K, F>(&self, ns: &str, usage: &mut ResourceList, extract: F) -> Result<()>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        F: Fn(&Extractor, &K) -> Result<ResourceList, ExtractError>,
    {
        let api = Api::<K>::namespaced(self.client.clone(), ns);
        for obj in api.list(&ListParams::default()).await? {
            match extract(&self.extractor, &obj) {
                Ok(used) => usage.add_all(&used),
                Err(error) => {
                    let name = obj.meta().name.as_deref().unwrap_or_default();
                    warn!(%error, %ns, %name, kind = %K::kind(&()), "Skipping unreadable object");
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterState for KubeCluster {
    async fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let api = Api::<Namespace>::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await?;
        Ok(namespaces.iter().map(NamespaceInfo::from).collect())
    }

    async fn quotas(&self) -> Result<Vec<ClusterResourceQuota>> {
        let api = Api::<ClusterResourceQuota>::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn namespace_usage(
        &self,
        ns: &str,
        resources: &BTreeSet<ResourceName>,
    ) -> Result<ResourceList> {
        let mut usage = ResourceList::default();

        if resources.iter().any(is_pod_resource) {
            self.sum::<Pod, _>(ns, &mut usage, Extractor::pod_usage)
                .await?;
        }
        if resources.iter().any(is_claim_resource) {
            self.sum::<PersistentVolumeClaim, _>(ns, &mut usage, Extractor::persistent_volume_claim)
                .await?;
        }
        if resources.iter().any(is_service_resource) {
            self.sum::<Service, _>(ns, &mut usage, Extractor::service)
                .await?;
        }

        for kind in self.object_counts.iter() {
            let name = kind.count_resource();
            if !resources.contains(&name) {
                continue;
            }
            let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.resource);
            let ar = ApiResource::from_gvk_with_plural(&gvk, &kind.resource);
            let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), ns, &ar);
            let count = api.list_metadata(&ListParams::default()).await?.items.len();
            usage.add(name, Quantity::from_units(count as i64));
        }

        let usage = usage.restrict(resources);
        debug!(%ns, %usage, "Computed namespace usage");
        Ok(usage)
    }
}
