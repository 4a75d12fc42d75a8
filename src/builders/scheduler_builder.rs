//! Builder wiring a [`Scheduler`] from configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{LockBackendConfig, QueueBackendConfig, SchedulerConfig};
use crate::core::{
    AdvisoryLock, BackendRegistry, BotRegistry, Deployer, DeploymentQueue, HeartbeatMonitor, ImagePullLock,
    InMemoryAuditSink, LockStore, PlatformBackend, QueueStore, Reconciler, RecoveryWorker, Scheduler,
    SchedulerError, SharedAudit, SlotAllocator, SlotStore, Spawn,
};
use crate::infra::{
    FileLockStore, HttpPaasBackend, InMemoryBotRegistry, InMemoryLockStore, InMemoryQueue, InMemorySlotStore,
    LocalProcessBackend, YaqueQueue,
};
use crate::runtime::TokioSpawner;
use crate::util::serde::BackendKind;

/// Assembles the components of one scheduler instance.
///
/// Stores left unset come from the configuration (queue and lock) or default
/// to in-memory (slots and bot records). Several schedulers built with the
/// same store handles behave like separate processes sharing a database.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    slots: Option<Arc<dyn SlotStore>>,
    queue: Option<Arc<dyn QueueStore>>,
    locks: Option<Arc<dyn LockStore>>,
    bots: Option<Arc<dyn BotRegistry>>,
    backends: Vec<Arc<dyn PlatformBackend>>,
    configured_backends: bool,
    audit: Option<SharedAudit>,
    spawner: Option<Arc<dyn Spawn>>,
}

impl SchedulerBuilder {
    /// Builder over `config`.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            slots: None,
            queue: None,
            locks: None,
            bots: None,
            backends: Vec::new(),
            configured_backends: false,
            audit: None,
            spawner: None,
        }
    }

    /// Use this slot table.
    #[must_use]
    pub fn with_slot_store(mut self, slots: Arc<dyn SlotStore>) -> Self {
        self.slots = Some(slots);
        self
    }

    /// Use this queue table instead of the configured one.
    #[must_use]
    pub fn with_queue_store(mut self, queue: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use this lease table instead of the configured one.
    #[must_use]
    pub fn with_lock_store(mut self, locks: Arc<dyn LockStore>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Report terminal bot states here.
    #[must_use]
    pub fn with_bot_registry(mut self, bots: Arc<dyn BotRegistry>) -> Self {
        self.bots = Some(bots);
        self
    }

    /// Register a backend adapter. A later adapter of the same kind replaces
    /// an earlier one.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn PlatformBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Also register the built-in adapters for backends present in the
    /// configuration (local process and PaaS).
    #[must_use]
    pub const fn with_configured_backends(mut self) -> Self {
        self.configured_backends = true;
        self
    }

    /// Record lifecycle events here instead of a fresh in-memory sink.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAudit) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run deployments through this spawner instead of the current tokio
    /// runtime.
    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawn>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Validate the configuration and wire every component.
    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        let cfg = self.config;
        cfg.validate()
            .map_err(|e| SchedulerError::ConfigInvalid(format!("config invalid: {e}")))?;

        let mut candidates = Vec::new();
        if self.configured_backends {
            candidates.extend(configured_backends(&cfg)?);
        }
        candidates.extend(self.backends);

        let mut registry = BackendRegistry::new();
        for backend in candidates {
            let kind = backend.kind();
            if cfg.is_enabled(kind) {
                registry.register(backend);
            } else {
                tracing::info!(backend = %kind, "backend disabled by configuration");
            }
        }
        if registry.kinds().is_empty() {
            return Err(SchedulerError::ConfigInvalid("no backend registered".into()));
        }
        registry.set_priority(
            cfg.backend_priority
                .iter()
                .copied()
                .filter(|k| cfg.is_enabled(*k))
                .collect(),
        );

        let slots = self
            .slots
            .unwrap_or_else(|| Arc::new(InMemorySlotStore::new()));
        let queue_store = match self.queue {
            Some(queue) => queue,
            None => queue_store(&cfg.queue)?,
        };
        let locks = match self.locks {
            Some(locks) => locks,
            None => lock_store(&cfg.lock)?,
        };
        let bots = self
            .bots
            .unwrap_or_else(|| Arc::new(InMemoryBotRegistry::new()));
        let audit: SharedAudit = self
            .audit
            .unwrap_or_else(|| Arc::new(InMemoryAuditSink::new(cfg.audit_capacity)));
        let spawner: Arc<dyn Spawn> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(TokioSpawner::current().map_err(|e| {
                SchedulerError::ConfigInvalid(format!("no spawner given and no tokio runtime: {e}"))
            })?),
        };

        let lock = AdvisoryLock::new(locks, cfg.lock_timing());
        let allocator = SlotAllocator::new(slots, lock, cfg.lock_timeout()).with_audit(Arc::clone(&audit));
        let heartbeats = Arc::new(HeartbeatMonitor::new(
            cfg.heartbeat_timing(),
            allocator.clone(),
            Arc::clone(&bots),
            Some(Arc::clone(&audit)),
        ));
        let deployer = Deployer::new(
            registry.clone(),
            ImagePullLock::new(cfg.image_pull_lock_enabled),
            Arc::clone(&heartbeats),
            cfg.deploy_retry_policy(),
        );
        let queue = DeploymentQueue::new(
            queue_store,
            allocator.clone(),
            registry.clone(),
            deployer,
            spawner,
            cfg.queue_limits(),
            Some(Arc::clone(&audit)),
        );
        let recovery = Arc::new(RecoveryWorker::new(
            allocator.clone(),
            registry.clone(),
            Arc::clone(&bots),
            cfg.recovery_policy(),
            Some(Arc::clone(&audit)),
        ));
        let reconciler = Arc::new(Reconciler::new(
            allocator.clone(),
            registry.clone(),
            cfg.reconcile_interval(),
            Some(Arc::clone(&audit)),
        ));

        tracing::info!(
            backends = ?registry.kinds(),
            max_concurrent = cfg.max_concurrent_deployments,
            pull_lock = cfg.image_pull_lock_enabled,
            "scheduler built"
        );
        Ok(Scheduler {
            allocator,
            backends: registry,
            queue,
            heartbeats,
            recovery,
            reconciler,
            bots,
            audit: Some(audit),
        })
    }
}

fn queue_store(cfg: &QueueBackendConfig) -> Result<Arc<dyn QueueStore>, SchedulerError> {
    Ok(match cfg {
        QueueBackendConfig::InMemory => Arc::new(InMemoryQueue::new()),
        QueueBackendConfig::File { path, stream } => Arc::new(YaqueQueue::new(path, stream.as_str())?),
    })
}

fn lock_store(cfg: &LockBackendConfig) -> Result<Arc<dyn LockStore>, SchedulerError> {
    Ok(match cfg {
        LockBackendConfig::InMemory => Arc::new(InMemoryLockStore::new()),
        LockBackendConfig::File { dir } => Arc::new(FileLockStore::new(dir)?),
    })
}

fn configured_backends(cfg: &SchedulerConfig) -> Result<Vec<Arc<dyn PlatformBackend>>, SchedulerError> {
    let mut out: Vec<Arc<dyn PlatformBackend>> = Vec::new();
    let mut kinds: Vec<_> = cfg.backends.iter().filter(|(_, b)| b.enabled).collect();
    kinds.sort_by_key(|(kind, _)| **kind);
    for (kind, backend) in kinds {
        match kind {
            BackendKind::Local => {
                let mut local = LocalProcessBackend::new();
                if let Some(command) = &backend.command {
                    let args: Vec<&str> = backend.args.iter().map(String::as_str).collect();
                    local = local.with_default_command(command.as_str(), &args);
                }
                out.push(Arc::new(local));
            }
            BackendKind::Paas => {
                let endpoint = backend.endpoint.as_deref().ok_or_else(|| {
                    SchedulerError::ConfigInvalid("backend `paas` needs an endpoint".into())
                })?;
                let token = backend
                    .token_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok());
                out.push(Arc::new(HttpPaasBackend::new(
                    endpoint,
                    token,
                    Duration::from_secs(backend.request_timeout_secs),
                )?));
            }
            BackendKind::ContainerTask | BackendKind::Cluster => {
                tracing::warn!(backend = %kind, "no built-in adapter; register one with with_backend");
            }
        }
    }
    Ok(out)
}
