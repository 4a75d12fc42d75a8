//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use prometheus_bot_pool::builders::SchedulerBuilder;
use prometheus_bot_pool::config::{BackendConfig, SchedulerConfig};
use prometheus_bot_pool::core::{
    AuditAction, BotRegistry, DeploymentRequest, InMemoryAuditSink, LockStore, PlatformBackend, QueueStore, Scheduler,
    SharedAudit, SlotStore,
};
use prometheus_bot_pool::infra::{
    InMemoryBackend, InMemoryBotRegistry, InMemoryLockStore, InMemoryQueue, InMemorySlotStore,
};
use prometheus_bot_pool::util::serde::{BackendKind, Priority};

/// Config with fast retries and a short dispatcher poll.
pub fn fast_config() -> SchedulerConfig {
    let mut cfg = SchedulerConfig::default();
    cfg.backend_priority = vec![BackendKind::Local, BackendKind::Paas];
    cfg.deploy_retry.backoff_base_ms = 1;
    cfg.deploy_retry.backoff_max_ms = 5;
    cfg.lock_timeout_ms = 2_000;
    cfg.dispatch_poll_ms = 20;
    cfg
}

/// Set a per-backend cap.
pub fn cap_backend(cfg: &mut SchedulerConfig, kind: BackendKind, max: u32) {
    cfg.backends.insert(
        kind,
        BackendConfig {
            max_concurrent_slots: Some(max),
            ..BackendConfig::default()
        },
    );
}

/// One scheduler plus handles to everything it was built from.
pub struct Harness {
    pub scheduler: Scheduler,
    pub config: SchedulerConfig,
    pub local: Arc<InMemoryBackend>,
    pub paas: Arc<InMemoryBackend>,
    pub slots: Arc<InMemorySlotStore>,
    pub queue: Arc<InMemoryQueue>,
    pub locks: Arc<InMemoryLockStore>,
    pub bots: Arc<InMemoryBotRegistry>,
    pub audit: Arc<InMemoryAuditSink>,
}

impl Harness {
    /// Another scheduler instance sharing every store and backend, as a
    /// second process pointed at the same database would.
    pub fn sibling(&self) -> Scheduler {
        SchedulerBuilder::new(self.config.clone())
            .with_slot_store(Arc::clone(&self.slots) as Arc<dyn SlotStore>)
            .with_queue_store(Arc::clone(&self.queue) as Arc<dyn QueueStore>)
            .with_lock_store(Arc::clone(&self.locks) as Arc<dyn LockStore>)
            .with_bot_registry(Arc::clone(&self.bots) as Arc<dyn BotRegistry>)
            .with_backend(Arc::clone(&self.local) as Arc<dyn PlatformBackend>)
            .with_backend(Arc::clone(&self.paas) as Arc<dyn PlatformBackend>)
            .with_audit(Arc::clone(&self.audit) as SharedAudit)
            .build()
            .expect("scheduler builds")
    }

    /// Bot ids of `action` events in the order they were recorded.
    pub fn audited(&self, action: AuditAction) -> Vec<String> {
        self.audit
            .events_for(action)
            .into_iter()
            .filter_map(|e| e.bot_id)
            .collect()
    }
}

/// Scheduler over in-memory stores with a local and a PaaS backend. Must
/// run inside a tokio runtime.
pub fn harness(config: SchedulerConfig) -> Harness {
    let local = Arc::new(InMemoryBackend::new(BackendKind::Local));
    let paas = Arc::new(InMemoryBackend::new(BackendKind::Paas));
    let slots = Arc::new(InMemorySlotStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let locks = Arc::new(InMemoryLockStore::new());
    let bots = Arc::new(InMemoryBotRegistry::new());
    let audit = Arc::new(InMemoryAuditSink::new(1_000));

    let scheduler = SchedulerBuilder::new(config.clone())
        .with_slot_store(Arc::clone(&slots) as Arc<dyn SlotStore>)
        .with_queue_store(Arc::clone(&queue) as Arc<dyn QueueStore>)
        .with_lock_store(Arc::clone(&locks) as Arc<dyn LockStore>)
        .with_bot_registry(Arc::clone(&bots) as Arc<dyn BotRegistry>)
        .with_backend(Arc::clone(&local) as Arc<dyn PlatformBackend>)
        .with_backend(Arc::clone(&paas) as Arc<dyn PlatformBackend>)
        .with_audit(Arc::clone(&audit) as SharedAudit)
        .build()
        .expect("scheduler builds");

    Harness {
        scheduler,
        config,
        local,
        paas,
        slots,
        queue,
        locks,
        bots,
        audit,
    }
}

/// Request on the local backend.
pub fn local_request(bot_id: &str, priority: u8) -> DeploymentRequest {
    DeploymentRequest::new(bot_id)
        .with_backend(BackendKind::Local)
        .with_priority(Priority::new(priority))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
