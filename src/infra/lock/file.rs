//! Lock-file lease table.
//!
//! A key is a chain of numbered lease files `<key>.<generation>.lease`; the
//! highest generation is the current lease. Taking, renewing or giving up a
//! lease always creates the next generation with `create_new`, which the
//! filesystem makes atomic, so of several processes acting on the same
//! generation exactly one succeeds. Older generations are removed by the
//! winner. A file that cannot be parsed is treated as held until its
//! modification time is older than the lease TTL, since it may still be
//! mid-write.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::Lease;
use crate::core::{LockStore, SchedulerError};
use crate::util::clock::{add_ms, now_ms};

const LEASE_SUFFIX: &str = ".lease";

/// Lease table stored as lease files in a directory.
pub struct FileLockStore {
    dir: PathBuf,
}

/// Current state of one key.
enum Head {
    Free,
    Held { generation: u64, lease: Option<Lease> },
    /// The listed head was replaced while being read.
    Superseded,
}

impl FileLockStore {
    /// Use (and create) `dir` for lock files.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn stem(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    fn lease_path(&self, stem: &str, generation: u64) -> PathBuf {
        self.dir.join(format!("{stem}.{generation:020}{LEASE_SUFFIX}"))
    }

    fn generations(&self, stem: &str) -> Result<Vec<u64>, SchedulerError> {
        let prefix = format!("{stem}.");
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(generation) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(LEASE_SUFFIX))
                .and_then(|n| n.parse::<u64>().ok())
            {
                found.push(generation);
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    fn head(&self, stem: &str) -> Result<Head, SchedulerError> {
        let Some(&generation) = self.generations(stem)?.last() else {
            return Ok(Head::Free);
        };
        let lease = match fs::read_to_string(self.lease_path(stem, generation)) {
            Ok(raw) => serde_json::from_str(&raw).ok(),
            // Superseded and cleaned up between listing and reading.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Head::Superseded),
            Err(e) => return Err(e.into()),
        };
        Ok(Head::Held { generation, lease })
    }

    /// Write `lease` as `generation`. `false` if another process got there first.
    fn create(&self, stem: &str, generation: u64, lease: &Lease) -> Result<bool, SchedulerError> {
        let path = self.lease_path(stem, generation);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(serde_json::to_string(lease)?.as_bytes())?;
                file.sync_all()?;
                self.prune(stem, generation);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn prune(&self, stem: &str, below: u64) {
        let Ok(generations) = self.generations(stem) else { return };
        for generation in generations.into_iter().filter(|g| *g < below) {
            if let Err(e) = fs::remove_file(self.lease_path(stem, generation)) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::debug!(stem, generation, error = %e, "failed to prune old lease file");
                }
            }
        }
    }

    fn older_than(path: &Path, ttl: Duration) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > ttl)
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, SchedulerError> {
        let stem = Self::stem(key);
        let now = now_ms();
        let lease = Lease {
            owner: owner.to_owned(),
            expires_at_ms: add_ms(now, ttl),
        };

        let next = match self.head(&stem)? {
            Head::Free => 0,
            Head::Superseded => return Ok(false),
            Head::Held { generation, lease: Some(existing) } => {
                if existing.blocks(owner, now) {
                    return Ok(false);
                }
                if existing.owner != owner && existing.expires_at_ms > 0 {
                    tracing::warn!(key, previous_owner = %existing.owner, "taking over expired lock lease");
                }
                generation + 1
            }
            Head::Held { generation, lease: None } => {
                if !Self::older_than(&self.lease_path(&stem, generation), ttl) {
                    return Ok(false);
                }
                tracing::warn!(key, "replacing unreadable stale lock file");
                generation + 1
            }
        };
        self.create(&stem, next, &lease)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), SchedulerError> {
        let stem = Self::stem(key);
        if let Head::Held { generation, lease: Some(lease) } = self.head(&stem)? {
            if lease.owner == owner && lease.expires_at_ms > 0 {
                // An expired successor; losing this race means someone else took over.
                let released = Lease {
                    owner: owner.to_owned(),
                    expires_at_ms: 0,
                };
                self.create(&stem, generation + 1, &released)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_two_stores_on_one_directory_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLockStore::new(dir.path()).unwrap();
        let b = FileLockStore::new(dir.path()).unwrap();
        let ttl = Duration::from_secs(30);

        assert!(a.try_acquire("slot-pool:paas", "owner-a", ttl).await.unwrap());
        assert!(!b.try_acquire("slot-pool:paas", "owner-b", ttl).await.unwrap());

        a.release("slot-pool:paas", "owner-a").await.unwrap();
        a.release("slot-pool:paas", "owner-a").await.unwrap();
        assert!(b.try_acquire("slot-pool:paas", "owner-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLockStore::new(dir.path()).unwrap();
        assert!(store.try_acquire("k", "a", Duration::ZERO).await.unwrap());
        assert!(store.try_acquire("k", "b", Duration::from_secs(30)).await.unwrap());
        // a no longer owns it, so its release must not drop b's lease.
        store.release("k", "a").await.unwrap();
        assert!(!store.try_acquire("k", "c", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_takeover_of_one_stale_generation_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLockStore::new(dir.path()).unwrap();
        assert!(store.try_acquire("k", "crashed", Duration::ZERO).await.unwrap());

        // Both contenders read the same stale generation before either writes.
        let stem = FileLockStore::stem("k");
        let Head::Held { generation, .. } = store.head(&stem).unwrap() else {
            panic!("lease file missing");
        };
        let lease = |owner: &str| Lease {
            owner: owner.to_owned(),
            expires_at_ms: add_ms(now_ms(), Duration::from_secs(30)),
        };
        assert!(store.create(&stem, generation + 1, &lease("a")).unwrap());
        assert!(!store.create(&stem, generation + 1, &lease("b")).unwrap());

        assert!(!store.try_acquire("k", "b", Duration::from_secs(30)).await.unwrap());
        assert!(store.try_acquire("k", "a", Duration::from_secs(30)).await.unwrap());
        assert_eq!(store.generations(&stem).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_keeps_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLockStore::new(dir.path()).unwrap();
        assert!(store.try_acquire("k", "a", Duration::from_millis(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(store.try_acquire("k", "a", Duration::from_secs(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.try_acquire("k", "b", Duration::from_secs(30)).await.unwrap());
    }
}
