//! Scriptable in-memory backend for tests and dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::backend::{DeployConfig, InstanceStatus, PlatformBackend};
use crate::core::model::InstanceRef;
use crate::core::SchedulerError;
use crate::util::serde::BackendKind;

#[derive(Default)]
struct Inventory {
    instances: BTreeMap<String, InstanceStatus>,
    by_key: BTreeMap<String, String>,
    deploy_failures: VecDeque<SchedulerError>,
    pull_failure: Option<SchedulerError>,
}

/// Backend whose inventory is a map. Can stand in for any [`BackendKind`] and
/// can be told to fail or stall.
pub struct InMemoryBackend {
    kind: BackendKind,
    inventory: Mutex<Inventory>,
    pull_delay: Mutex<Duration>,
    deploy_delay: Mutex<Duration>,
    panic_on_deploy: AtomicBool,
    pulls: AtomicUsize,
    deploys: AtomicUsize,
    not_found_deletes: AtomicUsize,
    next_id: AtomicUsize,
}

impl InMemoryBackend {
    /// Empty backend reporting `kind`.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            inventory: Mutex::new(Inventory::default()),
            pull_delay: Mutex::new(Duration::ZERO),
            deploy_delay: Mutex::new(Duration::ZERO),
            panic_on_deploy: AtomicBool::new(false),
            pulls: AtomicUsize::new(0),
            deploys: AtomicUsize::new(0),
            not_found_deletes: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Fail the next deploy calls with `err`, in order.
    pub fn fail_next_deploys(&self, err: SchedulerError, times: usize) {
        let mut inv = self.inventory.lock();
        for _ in 0..times {
            inv.deploy_failures.push_back(err.clone());
        }
    }

    /// Fail every pull with `err` until cleared with `None`.
    pub fn fail_pulls(&self, err: Option<SchedulerError>) {
        self.inventory.lock().pull_failure = err;
    }

    /// Make each pull take `delay`.
    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock() = delay;
    }

    /// Make each deploy take `delay`.
    pub fn set_deploy_delay(&self, delay: Duration) {
        *self.deploy_delay.lock() = delay;
    }

    /// Panic inside deploy, to exercise unwinding paths.
    pub fn set_panic_on_deploy(&self, panic: bool) {
        self.panic_on_deploy.store(panic, Ordering::SeqCst);
    }

    /// Add an instance no slot knows about.
    pub fn insert_orphan(&self, id: &str) {
        self.inventory
            .lock()
            .instances
            .insert(id.to_owned(), InstanceStatus::Running);
    }

    /// Drop an instance behind the scheduler's back.
    pub fn remove_instance(&self, instance: &InstanceRef) {
        self.inventory.lock().instances.remove(instance.as_str());
    }

    /// Force the reported status of an instance.
    pub fn set_status(&self, instance: &InstanceRef, status: InstanceStatus) {
        self.inventory
            .lock()
            .instances
            .insert(instance.as_str().to_owned(), status);
    }

    /// Ids currently present.
    pub fn instance_ids(&self) -> Vec<String> {
        self.inventory.lock().instances.keys().cloned().collect()
    }

    /// Pulls performed.
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Deploy calls received, failed ones included.
    pub fn deploy_count(&self) -> usize {
        self.deploys.load(Ordering::SeqCst)
    }

    /// Deletes that found nothing to delete.
    pub fn not_found_deletes(&self) -> usize {
        self.not_found_deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformBackend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn pull_image(&self, image: &str) -> Result<(), SchedulerError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.inventory.lock().pull_failure.clone();
        failure.map_or(Ok(()), |e| {
            tracing::debug!(image, error = %e, "injected pull failure");
            Err(e)
        })
    }

    async fn deploy(&self, config: &DeployConfig) -> Result<InstanceRef, SchedulerError> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        let delay = *self.deploy_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        assert!(
            !self.panic_on_deploy.load(Ordering::SeqCst),
            "injected deploy panic for {}",
            config.slot_name
        );

        let mut inv = self.inventory.lock();
        if let Some(err) = inv.deploy_failures.pop_front() {
            return Err(err);
        }
        let key = config.idempotency_key();
        if let Some(existing) = inv.by_key.get(&key).cloned() {
            if inv.instances.contains_key(&existing) {
                return Ok(InstanceRef::new(existing));
            }
        }
        let id = match &config.instance {
            Some(instance) if config.bot_id.is_some() => instance.as_str().to_owned(),
            _ => format!(
                "{}-{}-{}",
                self.kind.as_str(),
                config.slot_name,
                self.next_id.fetch_add(1, Ordering::SeqCst)
            ),
        };
        inv.instances.insert(id.clone(), InstanceStatus::Running);
        inv.by_key.insert(key, id.clone());
        Ok(InstanceRef::new(id))
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<(), SchedulerError> {
        if let Some(status) = self.inventory.lock().instances.get_mut(instance.as_str()) {
            *status = InstanceStatus::Stopped;
        }
        Ok(())
    }

    async fn delete(&self, instance: &InstanceRef) -> Result<(), SchedulerError> {
        if self.inventory.lock().instances.remove(instance.as_str()).is_none() {
            self.not_found_deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn describe(&self, instance: &InstanceRef) -> Result<InstanceStatus, SchedulerError> {
        Ok(self
            .inventory
            .lock()
            .instances
            .get(instance.as_str())
            .copied()
            .unwrap_or(InstanceStatus::NotFound))
    }

    async fn list_all(&self) -> Result<Vec<InstanceRef>, SchedulerError> {
        Ok(self
            .inventory
            .lock()
            .instances
            .keys()
            .map(|id| InstanceRef::new(id.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = InMemoryBackend::new(BackendKind::Paas);
        let instance = backend.deploy(&DeployConfig::empty("paas-slot-1")).await.unwrap();
        backend.delete(&instance).await.unwrap();
        backend.delete(&instance).await.unwrap();
        assert_eq!(backend.not_found_deletes(), 1);
        assert_eq!(backend.describe(&instance).await.unwrap(), InstanceStatus::NotFound);
    }

    #[tokio::test]
    async fn test_deploy_retry_reuses_instance() {
        let backend = InMemoryBackend::new(BackendKind::Local);
        let cfg = DeployConfig::empty("local-slot-1");
        let a = backend.deploy(&cfg).await.unwrap();
        let b = backend.deploy(&cfg).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let backend = InMemoryBackend::new(BackendKind::Local);
        backend.fail_next_deploys(SchedulerError::BackendUnavailable("503".into()), 1);
        let cfg = DeployConfig::empty("local-slot-1");
        assert!(backend.deploy(&cfg).await.is_err());
        assert!(backend.deploy(&cfg).await.is_ok());
        assert_eq!(backend.deploy_count(), 2);
    }
}
