//! In-memory lease table.
//!
//! Shared by every scheduler handle holding the same `Arc`. Suitable for a
//! single process; use [`super::FileLockStore`] across processes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Lease;
use crate::core::{LockStore, SchedulerError};
use crate::util::clock::{add_ms, now_ms};

/// Lease table behind a mutex.
#[derive(Default)]
pub struct InMemoryLockStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockStore {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, if its lease has not expired.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = now_ms();
        self.leases
            .lock()
            .get(key)
            .filter(|l| l.expires_at_ms > now)
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, SchedulerError> {
        let now = now_ms();
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|l| l.blocks(owner, now)) {
            return Ok(false);
        }
        leases.insert(
            key.to_owned(),
            Lease {
                owner: owner.to_owned(),
                expires_at_ms: add_ms(now, ttl),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), SchedulerError> {
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|l| l.owner == owner) {
            leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_release() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.try_acquire("slot-pool:local", "a", ttl).await.unwrap());
        assert!(!store.try_acquire("slot-pool:local", "b", ttl).await.unwrap());
        // Re-entrant for the same owner.
        assert!(store.try_acquire("slot-pool:local", "a", ttl).await.unwrap());

        // Foreign release is ignored.
        store.release("slot-pool:local", "b").await.unwrap();
        assert_eq!(store.holder("slot-pool:local").as_deref(), Some("a"));

        store.release("slot-pool:local", "a").await.unwrap();
        store.release("slot-pool:local", "a").await.unwrap();
        assert!(store.try_acquire("slot-pool:local", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = InMemoryLockStore::new();
        assert!(store.try_acquire("k", "a", Duration::ZERO).await.unwrap());
        assert!(store.try_acquire("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("b"));
    }
}
