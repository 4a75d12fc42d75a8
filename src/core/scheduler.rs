//! Scheduler facade tying the components together.

use std::sync::Arc;

use crate::core::allocator::SlotAllocator;
use crate::core::audit::SharedAudit;
use crate::core::backend::BackendRegistry;
use crate::core::heartbeat::HeartbeatMonitor;
use crate::core::model::{BotTerminalStatus, DeploymentRequest, Slot};
use crate::core::queue::{DeploymentQueue, DeploymentTicket};
use crate::core::reconcile::{ReconcileReport, Reconciler};
use crate::core::recovery::RecoveryWorker;
use crate::core::{BotRegistry, SchedulerError};
use crate::util::serde::BackendKind;

/// One scheduler instance. Several instances may share the same stores.
///
/// Built by [`crate::builders::SchedulerBuilder`].
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) allocator: SlotAllocator,
    pub(crate) backends: BackendRegistry,
    pub(crate) queue: DeploymentQueue,
    pub(crate) heartbeats: Arc<HeartbeatMonitor>,
    pub(crate) recovery: Arc<RecoveryWorker>,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) bots: Arc<dyn BotRegistry>,
    pub(crate) audit: Option<SharedAudit>,
}

impl Scheduler {
    /// Submit a deployment request.
    pub async fn submit(&self, request: DeploymentRequest) -> Result<DeploymentTicket, SchedulerError> {
        self.queue.submit(request).await
    }

    /// Withdraw a queued request.
    pub async fn cancel(&self, bot_id: &str) -> Result<bool, SchedulerError> {
        self.queue.cancel(bot_id).await
    }

    /// The bot finished normally: stop its instance, free its slot, record
    /// it as completed.
    pub async fn finish(&self, bot_id: &str) -> Result<Slot, SchedulerError> {
        let slot = self
            .allocator
            .find_by_bot(bot_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("no slot held by bot {bot_id}")))?;
        self.heartbeats.untrack(bot_id);

        let backend = self.backends.get(slot.backend)?;
        if let Err(e) = backend.stop(&slot.instance).await {
            tracing::warn!(bot_id, instance = %slot.instance, error = %e, "failed to stop finished bot");
        }
        let released = self.allocator.release_held(slot.id, bot_id).await?.unwrap_or(slot);
        self.bots
            .mark_terminal(bot_id, BotTerminalStatus::Completed, None)
            .await?;
        tracing::info!(bot_id, slot = %released.name, "bot finished");
        Ok(released)
    }

    /// Liveness signal from a bot.
    pub async fn heartbeat(&self, bot_id: &str) -> Result<bool, SchedulerError> {
        self.heartbeats.beat(bot_id).await
    }

    /// Warm the pool with `count` new slots on `backend`.
    pub async fn provision(&self, backend: BackendKind, count: usize) -> Result<Vec<Slot>, SchedulerError> {
        let adapter = self.backends.get(backend)?;
        self.allocator.provision(adapter.as_ref(), count).await
    }

    /// Run one reconciliation pass now.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciler.run_once().await
    }

    /// Slot state machine.
    pub const fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    /// Registered backends.
    pub const fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Deployment queue.
    pub const fn queue(&self) -> &DeploymentQueue {
        &self.queue
    }

    /// Heartbeat monitor.
    pub const fn heartbeats(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeats
    }

    /// Recovery worker.
    pub const fn recovery(&self) -> &Arc<RecoveryWorker> {
        &self.recovery
    }

    /// Reconciliation worker.
    pub const fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Audit sink, if any.
    pub const fn audit(&self) -> Option<&SharedAudit> {
        self.audit.as_ref()
    }
}
