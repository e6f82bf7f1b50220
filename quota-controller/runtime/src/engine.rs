use crate::{
    locks::{Guard, Locks},
    reservations::Reservations,
    validation,
};
use cluster_quota_controller_core::{decision, Error, MetricsSink, ResourceList, ResourceName};
use cluster_quota_controller_k8s_api::{ClusterResourceQuota, ResourceExt};
use cluster_quota_controller_k8s_usage::{Aggregator, ClusterState, NamespaceInfo, ScopeResolver};
use std::{collections::BTreeSet, future::Future, sync::Arc};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

/// Decides whether usage may be added to the quotas that govern a namespace.
pub(crate) struct Engine {
    cluster: Arc<dyn ClusterState>,
    aggregator: Aggregator,
    resolver: ScopeResolver,
    locks: Locks,
    reservations: Reservations,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Config {
    pub staleness_tolerance: Duration,
    pub reservation_ttl: Duration,
}

/// A quota that limits at least one resource of a request.
struct Applicable {
    name: String,
    quota: ClusterResourceQuota,
    hard: ResourceList,
    resources: BTreeSet<ResourceName>,
}

impl Engine {
    pub(crate) fn new(
        cluster: Arc<dyn ClusterState>,
        metrics: Arc<dyn MetricsSink>,
        resolver: ScopeResolver,
        config: Config,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(cluster.clone(), metrics, config.staleness_tolerance),
            cluster,
            resolver,
            locks: Locks::default(),
            reservations: Reservations::new(config.reservation_ttl),
        }
    }

    /// Checks adding `delta` to namespace `ns` against every quota whose scope
    /// includes it. When allowed, and unless this is a dry run, the delta is
    /// reserved against each of those quotas.
    pub(crate) async fn admit_usage(
        &self,
        ns: &str,
        delta: ResourceList,
        dry_run: bool,
        deadline: Instant,
    ) -> Result<(), Error> {
        let delta = delta.non_zero();
        if delta.is_empty() {
            return Ok(());
        }

        let (namespaces, quotas) = self.list(deadline).await?;
        let Some(info) = namespaces.iter().find(|n| n.name == ns) else {
            debug!(%ns, "Namespace not found; no quota applies");
            return Ok(());
        };
        let quotas = quotas
            .into_iter()
            .filter(|q| self.resolver.selects(q.spec.namespace_selector.as_ref(), info))
            .collect();

        self.enforce(ns, &namespaces, quotas, &delta, dry_run, deadline)
            .await
    }

    /// Checks a namespace label change. The namespace's current usage counts
    /// as new usage for every quota that selects it only after the change.
    pub(crate) async fn admit_namespace_update(
        &self,
        old: &NamespaceInfo,
        new: &NamespaceInfo,
        dry_run: bool,
        deadline: Instant,
    ) -> Result<(), Error> {
        let (namespaces, quotas) = self.list(deadline).await?;
        let joined = quotas
            .into_iter()
            .filter(|q| {
                let selector = q.spec.namespace_selector.as_ref();
                self.resolver.selects(selector, new)
                    && !self.resolver.selects(selector, old)
                    && !q.tracked_namespaces().any(|ns| ns == new.name)
            })
            .collect::<Vec<_>>();
        if joined.is_empty() {
            return Ok(());
        }

        let resources = joined
            .iter()
            .filter_map(|q| q.hard_limits().ok())
            .flat_map(|hard| hard.names().cloned().collect::<Vec<_>>())
            .collect::<BTreeSet<_>>();
        let usage = self
            .aggregator
            .live_usage([new.name.as_str()], &resources, deadline)
            .await
            .map_err(unavailable)?
            .remove(&new.name)
            .unwrap_or_default();
        debug!(ns = %new.name, %usage, quotas = joined.len(), "Namespace joins quotas");

        self.enforce(&new.name, &namespaces, joined, &usage, dry_run, deadline)
            .await
    }

    /// Validates a quota's shape and, on update, that no namespace it
    /// accounts for already uses more than a new or lowered limit.
    pub(crate) async fn admit_quota(
        &self,
        quota: &ClusterResourceQuota,
        old: Option<&ClusterResourceQuota>,
        deadline: Instant,
    ) -> Result<(), Error> {
        let limits = validation::validate_quota(quota)
            .map_err(|error| Error::InvalidQuotaObject(error.to_string()))?;
        let Some(old) = old else {
            return Ok(());
        };

        let old_limits = old.hard_limits().unwrap_or_default();
        let tightened = limits
            .iter()
            .filter(|(name, limit)| !old_limits.contains(name) || **limit < old_limits.get(name))
            .map(|(name, limit)| (name.clone(), *limit))
            .collect::<ResourceList>();
        if tightened.is_empty() {
            return Ok(());
        }

        // Scope under the new selector plus every namespace the existing
        // status accounts for.
        let mut proposed = quota.clone();
        proposed.status = old.status.clone();
        let namespaces = bounded(deadline, "list namespaces", self.cluster.namespaces()).await?;
        let scope = self.resolver.resolve(&proposed, &namespaces);

        let resources = tightened.names().cloned().collect::<BTreeSet<_>>();
        let usage = self
            .aggregator
            .live_usage(scope.aggregated(), &resources, deadline)
            .await
            .map_err(unavailable)?;
        for (ns, used) in usage.iter() {
            for (resource, limit) in tightened.iter() {
                let current = used.get(resource);
                if current > *limit {
                    return Err(Error::InvalidQuotaObject(format!(
                        "namespace {ns} already uses {resource}={current}, \
                         exceeding the proposed limit {resource}={limit}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        deadline: Instant,
    ) -> Result<(Vec<NamespaceInfo>, Vec<ClusterResourceQuota>), Error> {
        tokio::try_join!(
            bounded(deadline, "list namespaces", self.cluster.namespaces()),
            bounded(deadline, "list quotas", self.cluster.quotas()),
        )
    }

    /// Checks `delta`, added to namespace `ns`, against each quota that
    /// limits one of its resources. Allowed deltas are reserved unless this
    /// is a dry run.
    async fn enforce(
        &self,
        ns: &str,
        namespaces: &[NamespaceInfo],
        quotas: Vec<ClusterResourceQuota>,
        delta: &ResourceList,
        dry_run: bool,
        deadline: Instant,
    ) -> Result<(), Error> {
        let mut applicable = quotas
            .into_iter()
            .filter_map(|quota| {
                let name = quota.name_any();
                let hard = match quota.hard_limits() {
                    Ok(hard) => hard,
                    Err(error) => {
                        warn!(quota = %name, %error, "Ignoring quota with invalid limits");
                        return None;
                    }
                };
                let resources = delta
                    .names()
                    .filter(|r| hard.contains(r))
                    .cloned()
                    .collect::<BTreeSet<_>>();
                if resources.is_empty() {
                    return None;
                }
                Some(Applicable {
                    name,
                    quota,
                    hard,
                    resources,
                })
            })
            .collect::<Vec<_>>();
        if applicable.is_empty() {
            return Ok(());
        }

        // Lock in name order so that concurrent requests spanning the same
        // quotas cannot deadlock.
        applicable.sort_by(|a, b| a.name.cmp(&b.name));
        let mut guards = Vec::<Guard>::with_capacity(applicable.len());
        for a in applicable.iter() {
            let lock = self.locks.get(&a.name);
            let guard = time::timeout_at(deadline, lock.lock_owned())
                .await
                .map_err(|_| {
                    Error::unavailable(format!("timed out waiting to admit against quota {}", a.name))
                })?;
            guards.push(guard);
        }

        let mut observed = Vec::with_capacity(applicable.len());
        for a in applicable.iter() {
            let scope = self.resolver.resolve(&a.quota, namespaces);
            let snapshot = self
                .aggregator
                .usage(&a.quota, &scope, &a.resources, deadline)
                .await
                .map_err(unavailable)?;

            let mut used = snapshot.total.clone();
            used.add_all(&self.reservations.pending(&a.name, &snapshot, &a.resources));
            if let Err(exceeded) = decision::check(&a.name, &a.hard, &used, delta) {
                info!(quota = %a.name, %exceeded, "Denied");
                return Err(exceeded.into());
            }
            observed.push(snapshot.namespaces.get(ns).cloned().unwrap_or_default());
        }

        if !dry_run {
            for (a, observed) in applicable.iter().zip(observed.iter()) {
                self.reservations
                    .reserve(&a.name, ns, delta.restrict(&a.resources), observed);
            }
        }
        drop(guards);
        Ok(())
    }
}

async fn bounded<T>(
    deadline: Instant,
    op: &'static str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, Error> {
    match time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Error::unavailable(format!("failed to {op}: {error:#}"))),
        Err(_) => Err(Error::unavailable(format!("timed out waiting to {op}"))),
    }
}

fn unavailable(error: anyhow::Error) -> Error {
    Error::unavailable(format!("{error:#}"))
}
