use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes admissions against the same quota within this process.
///
/// Locks are keyed by quota name so that admissions against unrelated quotas
/// proceed in parallel.
#[derive(Debug, Default)]
pub(crate) struct Locks(Mutex<HashMap<String, Arc<AsyncMutex<()>>>>);

pub(crate) type Guard = OwnedMutexGuard<()>;

impl Locks {
    pub(crate) fn get(&self, quota: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.0.lock();
        // Drop locks that nobody holds or waits on.
        locks.retain(|name, lock| name == quota || Arc::strong_count(lock) > 1);
        locks.entry(quota.to_string()).or_default().clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locks_are_per_quota() {
        let locks = Locks::default();
        let a = locks.get("a").lock_owned().await;
        let b = locks.get("b").try_lock_owned();
        assert!(b.is_ok(), "unrelated quotas must not contend");
        assert!(locks.get("a").try_lock_owned().is_err());
        drop(a);
        assert!(locks.get("a").try_lock_owned().is_ok());
    }

    #[tokio::test]
    async fn idle_locks_are_dropped() {
        let locks = Locks::default();
        drop(locks.get("a"));
        drop(locks.get("b"));
        drop(locks.get("c"));
        assert_eq!(locks.len(), 1);
    }
}
