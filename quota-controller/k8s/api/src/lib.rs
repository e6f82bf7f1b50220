#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod quota;

pub use self::{
    labels::{Labels, Selector},
    quota::{
        ClusterResourceQuota, ClusterResourceQuotaSpec, ClusterResourceQuotaStatus,
        NamespaceUsage, UsageStatus, QUOTA_API_GROUP,
    },
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Event, Namespace, PersistentVolumeClaim, Pod, PodSpec, Service},
    },
    apimachinery::pkg::api::resource::Quantity,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, ResourceExt},
    Client, Error, Resource,
};
