//! Drift repair between backend inventories and the slot table.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::allocator::SlotAllocator;
use crate::core::audit::{self, AuditAction, SharedAudit};
use crate::core::backend::{BackendRegistry, PlatformBackend};
use crate::core::lock::LockGuard;
use crate::core::model::{SlotFilter, SlotPatch, SlotStatus};
use crate::core::SchedulerError;
use crate::util::clock::now_ms;
use crate::util::serde::BackendKind;

/// Totals from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Backend instances with no slot, deleted from the backend.
    pub backend_orphans_deleted: usize,
    /// Slots with no backend instance, deleted locally.
    pub local_orphans_deleted: usize,
    /// Instances the backends reported.
    pub total_backend_instances: usize,
    /// Slots in the table.
    pub total_local_slots: usize,
    /// Orphaned slots left alone because a bot holds them.
    pub skipped_in_use: usize,
    /// Per-item and per-backend failures.
    pub failures: Vec<String>,
}

/// Periodic diff of `list_all()` against local slots.
pub struct Reconciler {
    allocator: SlotAllocator,
    backends: BackendRegistry,
    interval: Duration,
    audit: Option<SharedAudit>,
}

impl Reconciler {
    /// Reconciler over every backend in `backends`.
    pub const fn new(
        allocator: SlotAllocator,
        backends: BackendRegistry,
        interval: Duration,
        audit: Option<SharedAudit>,
    ) -> Self {
        Self {
            allocator,
            backends,
            interval,
            audit,
        }
    }

    /// Pause between passes.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Reconcile every registered backend. A backend that cannot be listed is
    /// reported in `failures` and the others still run.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (kind, backend) in self.backends.iter() {
            if let Err(e) = self.reconcile_backend(kind, backend.as_ref(), &mut report).await {
                tracing::error!(backend = %kind, error = %e, "reconciliation failed for backend");
                report.failures.push(format!("{kind}: {e}"));
            }
        }
        tracing::info!(
            backend_orphans = report.backend_orphans_deleted,
            local_orphans = report.local_orphans_deleted,
            backend_instances = report.total_backend_instances,
            local_slots = report.total_local_slots,
            skipped = report.skipped_in_use,
            failures = report.failures.len(),
            "reconciliation finished"
        );
        report
    }

    async fn reconcile_backend(
        &self,
        kind: BackendKind,
        backend: &dyn PlatformBackend,
        report: &mut ReconcileReport,
    ) -> Result<(), SchedulerError> {
        let guard = self
            .allocator
            .lock()
            .acquire(&kind.inventory_lock_key(), self.allocator.lock_timeout())
            .await?;
        let result = self.diff_and_repair(kind, backend, report, &guard).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(backend = %kind, error = %e, "failed to release inventory lock");
        }
        result
    }

    async fn diff_and_repair(
        &self,
        kind: BackendKind,
        backend: &dyn PlatformBackend,
        report: &mut ReconcileReport,
        guard: &LockGuard,
    ) -> Result<(), SchedulerError> {
        let store = self.allocator.store();
        let remote = backend.list_all().await?;
        let local = store.list(&SlotFilter::all().on(kind)).await?;
        report.total_backend_instances += remote.len();
        report.total_local_slots += local.len();

        let known: HashSet<&str> = local.iter().map(|s| s.instance.as_str()).collect();
        let present: HashSet<&str> = remote.iter().map(|i| i.as_str()).collect();

        for instance in remote.iter().filter(|i| !known.contains(i.as_str())) {
            guard.renew().await?;
            match backend.delete(instance).await {
                Ok(()) => {
                    report.backend_orphans_deleted += 1;
                    tracing::info!(backend = %kind, instance = %instance, "deleted backend orphan");
                    audit::record(self.audit.as_ref(), instance.as_str(), kind, None, AuditAction::DeleteBackendOrphan, None);
                }
                Err(e) => {
                    tracing::error!(backend = %kind, instance = %instance, error = %e, "failed to delete backend orphan");
                    report.failures.push(format!("{kind}/{instance}: {e}"));
                }
            }
        }

        for slot in local.iter().filter(|s| !present.contains(s.instance.as_str())) {
            if slot.status.holds_bot() {
                report.skipped_in_use += 1;
                continue;
            }
            guard.renew().await?;
            // Park it first so a concurrent claim cannot take it mid-delete.
            let parked = store
                .update_if(
                    slot.id,
                    &[SlotStatus::Idle, SlotStatus::Error],
                    None,
                    &SlotPatch::error("backend instance missing"),
                    now_ms(),
                )
                .await;
            match parked {
                Ok(None) => report.skipped_in_use += 1,
                Ok(Some(_)) => match store.delete(slot.id).await {
                    Ok(_) => {
                        report.local_orphans_deleted += 1;
                        tracing::info!(backend = %kind, slot = %slot.name, "deleted local orphan");
                        audit::record(self.audit.as_ref(), slot.id.to_string(), kind, None, AuditAction::DeleteLocalOrphan, Some(slot.name.clone()));
                    }
                    Err(e) => report.failures.push(format!("{kind}/{}: {e}", slot.name)),
                },
                Err(e) => report.failures.push(format!("{kind}/{}: {e}", slot.name)),
            }
        }
        Ok(())
    }

    /// Run passes until `shutdown` flips or its sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "reconciliation worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciliation worker stopped");
    }
}
