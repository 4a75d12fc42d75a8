//! Advisory lock over a shared [`LockStore`].
//!
//! Every acquisition uses a fresh owner token, so two tasks of the same
//! scheduler exclude each other exactly like two schedulers do. Leases expire,
//! which bounds how long a crashed holder can block a key.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::{LockStore, SchedulerError};

/// Lease lengths and polling cadence for [`AdvisoryLock`].
#[derive(Debug, Clone, Copy)]
pub struct LockTiming {
    /// How long a lease lives unless released.
    pub lease: Duration,
    /// First wait between attempts; doubles up to eight times this value.
    pub poll: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            poll: Duration::from_millis(10),
        }
    }
}

/// Named mutual exclusion shared across scheduler instances.
#[derive(Clone)]
pub struct AdvisoryLock {
    store: Arc<dyn LockStore>,
    instance: String,
    timing: LockTiming,
}

impl AdvisoryLock {
    /// Lock backed by `store`.
    pub fn new(store: Arc<dyn LockStore>, timing: LockTiming) -> Self {
        Self {
            store,
            instance: uuid::Uuid::new_v4().simple().to_string(),
            timing,
        }
    }

    /// Token prefix identifying this scheduler instance in lease records.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Block until `key` is free or `timeout` elapses.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockGuard, SchedulerError> {
        let owner = format!("{}:{}", self.instance, uuid::Uuid::new_v4().simple());
        let deadline = Instant::now() + timeout;
        let max_poll = self.timing.poll * 8;
        let mut poll = self.timing.poll;

        loop {
            let attempted = Instant::now();
            if self.store.try_acquire(key, &owner, self.timing.lease).await? {
                tracing::trace!(key, owner = %owner, "lock acquired");
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    key: key.to_owned(),
                    owner,
                    lease: self.timing.lease,
                    expires: Mutex::new(attempted + self.timing.lease),
                    released: false,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(key, ?timeout, "lock acquisition timed out");
                return Err(SchedulerError::LockTimeout(key.to_owned()));
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
            poll = (poll * 2).min(max_poll);
        }
    }
}

/// A held lease. Call [`LockGuard::release`]; dropping the guard releases in
/// a background task as a fallback.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    key: String,
    owner: String,
    lease: Duration,
    expires: Mutex<Instant>,
    released: bool,
}

impl LockGuard {
    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lease by another full term. Long critical sections call
    /// this between steps. [`SchedulerError::LockLost`] means the lease ran
    /// out first, even if nobody has taken the key since.
    pub async fn renew(&self) -> Result<(), SchedulerError> {
        let attempted = Instant::now();
        if attempted < *self.expires.lock()
            && self.store.try_acquire(&self.key, &self.owner, self.lease).await?
        {
            *self.expires.lock() = attempted + self.lease;
            return Ok(());
        }
        tracing::warn!(key = %self.key, "lock lease lost before renewal");
        Err(SchedulerError::LockLost(self.key.clone()))
    }

    /// Release the lease. Releasing an expired or taken-over lease is a no-op.
    pub async fn release(mut self) -> Result<(), SchedulerError> {
        self.released = true;
        self.store.release(&self.key, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release(&key, &owner).await {
                        tracing::warn!(key, error = %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => tracing::warn!(key, "lock dropped outside a runtime; lease will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemoryLockStore;

    fn lock(store: &Arc<InMemoryLockStore>) -> AdvisoryLock {
        AdvisoryLock::new(store.clone(), LockTiming::default())
    }

    #[tokio::test]
    async fn test_same_instance_tasks_exclude_each_other() {
        let store = Arc::new(InMemoryLockStore::new());
        let lock = lock(&store);
        let held = lock.acquire("slot-pool:local", Duration::from_millis(50)).await.unwrap();
        let err = lock
            .acquire("slot-pool:local", Duration::from_millis(30))
            .await
            .err()
            .unwrap();
        assert_eq!(err, SchedulerError::LockTimeout("slot-pool:local".into()));
        held.release().await.unwrap();
        assert!(lock.acquire("slot-pool:local", Duration::from_millis(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let store = Arc::new(InMemoryLockStore::new());
        let a = lock(&store);
        let b = lock(&store);
        let held = a.acquire("k", Duration::from_millis(10)).await.unwrap();
        let waiter = tokio::spawn(async move { b.acquire("k", Duration::from_secs(2)).await.map(|g| g.key().to_owned()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "k");
    }

    #[tokio::test]
    async fn test_renew_extends_and_detects_loss() {
        let store = Arc::new(InMemoryLockStore::new());
        let short = AdvisoryLock::new(
            store.clone(),
            LockTiming {
                lease: Duration::from_millis(100),
                poll: Duration::from_millis(5),
            },
        );
        let other = lock(&store);

        let held = short.acquire("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        held.renew().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(other.acquire("k", Duration::from_millis(10)).await.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let thief = other.acquire("k", Duration::from_millis(10)).await.unwrap();
        assert_eq!(held.renew().await.unwrap_err(), SchedulerError::LockLost("k".into()));
        thief.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_after_expiry_fails_even_when_key_is_free() {
        let store = Arc::new(InMemoryLockStore::new());
        let short = AdvisoryLock::new(
            store.clone(),
            LockTiming {
                lease: Duration::from_millis(20),
                poll: Duration::from_millis(5),
            },
        );
        let held = short.acquire("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(held.renew().await, Err(SchedulerError::LockLost(_))));
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let store = Arc::new(InMemoryLockStore::new());
        let lock = lock(&store);
        drop(lock.acquire("k", Duration::from_millis(10)).await.unwrap());
        assert!(lock.acquire("k", Duration::from_secs(1)).await.is_ok());
    }
}
