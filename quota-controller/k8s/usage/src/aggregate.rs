use crate::{ClusterState, Scope};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use cluster_quota_controller_core::{MetricsSink, ResourceList, ResourceName};
use cluster_quota_controller_k8s_api::{ClusterResourceQuota, ResourceExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

/// Sums the usage of a quota's resources over its scope.
#[derive(Clone)]
pub struct Aggregator {
    cluster: Arc<dyn ClusterState>,
    metrics: Arc<dyn MetricsSink>,
    staleness_tolerance: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// Read from the quota's reconciler-maintained status.
    Status,

    /// Summed from live objects in each namespace.
    Recomputed,
}

/// A point-in-time reading of a quota's usage, taken for a single decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub source: Source,
    pub total: ResourceList,

    /// Usage of each aggregated namespace.
    pub namespaces: BTreeMap<String, ResourceList>,

    /// When the status a snapshot was read from was computed.
    pub synced: Option<DateTime<Utc>>,
}

// === impl Aggregator ===

impl Aggregator {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        metrics: Arc<dyn MetricsSink>,
        staleness_tolerance: Duration,
    ) -> Self {
        Self {
            cluster,
            metrics,
            staleness_tolerance,
        }
    }

    /// Reads the usage of `resources` for `quota`.
    ///
    /// The quota's status is used when it was synced within the staleness
    /// tolerance, accounts for exactly the namespaces in scope, and accounts
    /// for every requested resource. Otherwise usage is recomputed from live
    /// objects in every aggregated namespace, concurrently, bounded by
    /// `deadline`.
    pub async fn usage(
        &self,
        quota: &ClusterResourceQuota,
        scope: &Scope,
        resources: &BTreeSet<ResourceName>,
        deadline: Instant,
    ) -> Result<UsageSnapshot> {
        let name = quota.name_any();
        let started = Instant::now();

        let snapshot = match self.fresh_status(quota, scope, resources) {
            Some(snapshot) => snapshot,
            None => self.recompute(&name, scope, resources, deadline).await?,
        };

        self.metrics.aggregation(&name, started.elapsed());
        self.metrics.total_usage(&name, &snapshot.total);
        for (ns, used) in snapshot.namespaces.iter() {
            self.metrics.namespace_usage(&name, ns, used);
        }
        debug!(quota = %name, source = ?snapshot.source, total = %snapshot.total, "Aggregated usage");
        Ok(snapshot)
    }

    /// Sums live usage over the given namespaces without consulting status.
    pub async fn live_usage<'n>(
        &self,
        namespaces: impl IntoIterator<Item = &'n str>,
        resources: &BTreeSet<ResourceName>,
        deadline: Instant,
    ) -> Result<BTreeMap<String, ResourceList>> {
        let reads = namespaces.into_iter().map(|ns| async move {
            let used = time::timeout_at(deadline, self.cluster.namespace_usage(ns, resources))
                .await
                .map_err(|_| anyhow!("timed out reading usage in namespace {ns}"))?
                .with_context(|| format!("failed to read usage in namespace {ns}"))?;
            Ok::<_, anyhow::Error>((ns.to_string(), used))
        });
        let used = futures::future::try_join_all(reads).await?;
        Ok(used.into_iter().collect())
    }

    async fn recompute(
        &self,
        quota: &str,
        scope: &Scope,
        resources: &BTreeSet<ResourceName>,
        deadline: Instant,
    ) -> Result<UsageSnapshot> {
        let namespaces = self
            .live_usage(scope.aggregated(), resources, deadline)
            .await?;
        let mut total = ResourceList::default();
        for used in namespaces.values() {
            total.add_all(used);
        }
        debug!(%quota, namespaces = namespaces.len(), "Recomputed usage");
        Ok(UsageSnapshot {
            source: Source::Recomputed,
            total: total.restrict(resources),
            namespaces,
            synced: None,
        })
    }

    fn fresh_status(
        &self,
        quota: &ClusterResourceQuota,
        scope: &Scope,
        resources: &BTreeSet<ResourceName>,
    ) -> Option<UsageSnapshot> {
        let synced = quota.last_sync_time()?;
        let synced = match DateTime::parse_from_rfc3339(synced) {
            Ok(t) => t.with_timezone(&Utc),
            Err(error) => {
                warn!(quota = %quota.name_any(), %error, "Ignoring unparseable status sync time");
                return None;
            }
        };
        // A sync time in the future means the clocks disagree; trust nothing.
        let age = Utc::now().signed_duration_since(synced).to_std().ok()?;
        if age > self.staleness_tolerance {
            return None;
        }

        // Status must account for exactly the namespaces in scope. A tracked
        // namespace that is now excluded or gone still counts in its total.
        let tracked = quota.tracked_namespaces().collect::<BTreeSet<_>>();
        let aggregated = scope.aggregated().collect::<BTreeSet<_>>();
        if tracked != aggregated {
            debug!(quota = %quota.name_any(), "Status does not match scope");
            return None;
        }

        let used = match quota.status_used() {
            Ok(used) => used?,
            Err(error) => {
                warn!(quota = %quota.name_any(), %error, "Ignoring unparseable status usage");
                return None;
            }
        };
        if resources.iter().any(|r| !used.contains(r)) {
            return None;
        }

        let mut namespaces = BTreeMap::new();
        for ns in aggregated {
            match quota.status_namespace_used(ns) {
                Ok(Some(used)) => {
                    namespaces.insert(ns.to_string(), used.restrict(resources));
                }
                Ok(None) => return None,
                Err(error) => {
                    warn!(quota = %quota.name_any(), %ns, %error, "Ignoring unparseable status usage");
                    return None;
                }
            }
        }

        Some(UsageSnapshot {
            source: Source::Status,
            total: used.restrict(resources),
            namespaces,
            synced: Some(synced),
        })
    }
}
