use crate::usage::{Source, UsageSnapshot};
use chrono::{DateTime, Utc};
use cluster_quota_controller_core::{ResourceList, ResourceName};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tokio::time::{Duration, Instant};

/// Usage admitted by this process that aggregation may not observe yet.
///
/// An admitted object only becomes visible to aggregation once the API
/// server persists it and, on the status path, once the reconciler has
/// synced. A reservation counts toward its quota until a snapshot shows the
/// reserved usage, or until it expires.
#[derive(Debug)]
pub(crate) struct Reservations {
    ttl: Duration,
    by_quota: Mutex<HashMap<String, Vec<Reservation>>>,
}

#[derive(Debug)]
struct Reservation {
    namespace: String,
    usage: ResourceList,

    /// Namespace usage at which the reserved usage has become visible: what
    /// aggregation saw when it was admitted, plus every earlier reservation
    /// in the namespace, plus its own usage.
    visible_at: ResourceList,
    reserved_at: DateTime<Utc>,
    expires: Instant,
}

impl Reservations {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            by_quota: Default::default(),
        }
    }

    /// Sums the reservations held against `quota` that `snapshot` does not
    /// already account for, restricted to `resources`. Reservations the
    /// snapshot shows to be visible are released.
    pub(crate) fn pending(
        &self,
        quota: &str,
        snapshot: &UsageSnapshot,
        resources: &BTreeSet<ResourceName>,
    ) -> ResourceList {
        let now = Instant::now();
        let mut by_quota = self.by_quota.lock();
        let mut pending = ResourceList::default();
        if let Some(reservations) = by_quota.get_mut(quota) {
            reservations.retain(|r| r.expires > now && !r.observed(snapshot, resources));
            for r in reservations.iter() {
                pending.add_all(&r.usage.restrict(resources));
            }
            if reservations.is_empty() {
                by_quota.remove(quota);
            }
        }
        pending
    }

    /// Reserves `usage` added to namespace `ns` against `quota`, given the
    /// namespace's usage as aggregation last observed it.
    pub(crate) fn reserve(
        &self,
        quota: &str,
        ns: &str,
        usage: ResourceList,
        observed: &ResourceList,
    ) {
        let now = Instant::now();
        let mut by_quota = self.by_quota.lock();
        by_quota.retain(|_, reservations| {
            reservations.retain(|r| r.expires > now);
            !reservations.is_empty()
        });
        if usage.is_empty() {
            return;
        }

        let reservations = by_quota.entry(quota.to_string()).or_default();
        let mut visible_at = observed.restrict(usage.names());
        for earlier in reservations.iter().filter(|r| r.namespace == ns) {
            visible_at.add_all(&earlier.usage.restrict(usage.names()));
        }
        visible_at.add_all(&usage);

        reservations.push(Reservation {
            namespace: ns.to_string(),
            usage,
            visible_at,
            reserved_at: Utc::now(),
            expires: now + self.ttl,
        });
    }

    #[cfg(test)]
    pub(crate) fn quotas(&self) -> usize {
        self.by_quota.lock().len()
    }
}

impl Reservation {
    fn observed(&self, snapshot: &UsageSnapshot, resources: &BTreeSet<ResourceName>) -> bool {
        if snapshot.source == Source::Status
            && snapshot.synced.is_some_and(|synced| self.reserved_at < synced)
        {
            return true;
        }

        // A namespace outside the snapshot may yet join the quota's scope.
        let Some(used) = snapshot.namespaces.get(&self.namespace) else {
            return false;
        };
        let mut checked = self
            .visible_at
            .names()
            .filter(|r| resources.contains(*r))
            .peekable();
        checked.peek().is_some() && checked.all(|r| used.get(r) >= self.visible_at.get(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_quota_controller_core::Quantity;
    use maplit::btreemap;
    use std::collections::BTreeMap;

    fn cpu(units: i64) -> ResourceList {
        [("cpu", Quantity::from_units(units))].into_iter().collect()
    }

    fn cpu_resources() -> BTreeSet<ResourceName> {
        [ResourceName::new("cpu")].into_iter().collect()
    }

    fn recomputed(namespaces: BTreeMap<String, ResourceList>) -> UsageSnapshot {
        let mut total = ResourceList::default();
        for used in namespaces.values() {
            total.add_all(used);
        }
        UsageSnapshot {
            source: Source::Recomputed,
            total,
            namespaces,
            synced: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_expire() {
        let reservations = Reservations::new(Duration::from_secs(30));
        let unseen = recomputed(BTreeMap::new());
        reservations.reserve("q", "ns-a", cpu(1), &cpu(0));
        tokio::time::advance(Duration::from_secs(10)).await;
        reservations.reserve("q", "ns-a", cpu(2), &cpu(0));
        assert_eq!(reservations.pending("q", &unseen, &cpu_resources()), cpu(3));
        assert!(reservations
            .pending("other", &unseen, &cpu_resources())
            .is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(reservations.pending("q", &unseen, &cpu_resources()), cpu(2));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(reservations.pending("q", &unseen, &cpu_resources()).is_empty());
    }

    #[tokio::test]
    async fn observed_reservations_are_released() {
        let reservations = Reservations::new(Duration::from_secs(30));
        reservations.reserve("q", "ns-a", cpu(1), &cpu(2));
        reservations.reserve("q", "ns-a", cpu(1), &cpu(2));

        // Neither admitted pod is visible yet.
        let before = recomputed(btreemap! { "ns-a".to_string() => cpu(2) });
        assert_eq!(reservations.pending("q", &before, &cpu_resources()), cpu(2));

        // One is.
        let one = recomputed(btreemap! { "ns-a".to_string() => cpu(3) });
        assert_eq!(reservations.pending("q", &one, &cpu_resources()), cpu(1));

        // Both are.
        let both = recomputed(btreemap! { "ns-a".to_string() => cpu(4) });
        assert!(reservations.pending("q", &both, &cpu_resources()).is_empty());
        assert_eq!(reservations.quotas(), 0);
    }

    #[tokio::test]
    async fn reservations_outside_the_snapshot_are_kept() {
        let reservations = Reservations::new(Duration::from_secs(30));
        reservations.reserve("q", "ns-joining", cpu(2), &ResourceList::default());
        let snapshot = recomputed(btreemap! { "ns-a".to_string() => cpu(10) });
        assert_eq!(reservations.pending("q", &snapshot, &cpu_resources()), cpu(2));
    }

    #[tokio::test]
    async fn status_synced_after_a_reservation_accounts_for_it() {
        let reservations = Reservations::new(Duration::from_secs(30));
        reservations.reserve("q", "ns-a", cpu(1), &cpu(2));

        let status = |synced| UsageSnapshot {
            source: Source::Status,
            total: cpu(2),
            namespaces: btreemap! { "ns-a".to_string() => cpu(2) },
            synced: Some(synced),
        };
        let earlier = Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(
            reservations.pending("q", &status(earlier), &cpu_resources()),
            cpu(1)
        );

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(reservations
            .pending("q", &status(later), &cpu_resources())
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_reservations_of_other_quotas_are_pruned() {
        let reservations = Reservations::new(Duration::from_secs(30));
        reservations.reserve("deleted", "ns-a", cpu(1), &cpu(0));
        assert_eq!(reservations.quotas(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        reservations.reserve("q", "ns-a", cpu(1), &cpu(0));
        assert_eq!(reservations.quotas(), 1);
    }
}
