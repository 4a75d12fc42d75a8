//! Repairs slots stuck in error or in deploying.
//!
//! Each pass looks at error slots and at deploying slots whose status has
//! not changed for longer than the stuck threshold. A slot whose instance
//! still exists is stopped and reset to idle; a slot whose instance is gone
//! gets a new one under the same name. Failed attempts are spaced by
//! exponential backoff. Once more than `max_attempts` attempts have failed
//! the slot stays in error until an operator deletes or resets it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::allocator::SlotAllocator;
use crate::core::audit::{self, AuditAction, SharedAudit};
use crate::core::backend::{BackendRegistry, DeployConfig, PlatformBackend};
use crate::core::model::{BotTerminalStatus, Slot, SlotFilter, SlotPatch, SlotStatus};
use crate::core::{BotRegistry, SchedulerError};
use crate::util::backoff::ExponentialBackoff;
use crate::util::clock::{elapsed_ms, now_ms};

/// When and how often to retry.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    /// Pause between passes.
    pub interval: Duration,
    /// Deploying longer than this counts as stuck.
    pub stuck_threshold: Duration,
    /// Failed attempts allowed; the next failure parks the slot for an operator.
    pub max_attempts: u32,
    /// Spacing between attempts on one slot.
    pub backoff: ExponentialBackoff,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(600),
            max_attempts: 5,
            backoff: ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(600)),
        }
    }
}

/// Result of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Slots considered.
    pub examined: usize,
    /// Slots back to idle.
    pub recovered: usize,
    /// Attempts that failed this pass.
    pub failed: usize,
    /// Slots that hit the attempt limit this pass.
    pub exhausted: usize,
    /// Slots left alone (backing off, already exhausted, or changed under us).
    pub skipped: usize,
    /// Per-slot failure messages.
    pub errors: Vec<String>,
}

/// Background repair of broken slots.
pub struct RecoveryWorker {
    allocator: SlotAllocator,
    backends: BackendRegistry,
    bots: Arc<dyn BotRegistry>,
    policy: RecoveryPolicy,
    audit: Option<SharedAudit>,
}

impl RecoveryWorker {
    /// Worker repairing slots of every backend in `backends`.
    pub fn new(
        allocator: SlotAllocator,
        backends: BackendRegistry,
        bots: Arc<dyn BotRegistry>,
        policy: RecoveryPolicy,
        audit: Option<SharedAudit>,
    ) -> Self {
        Self {
            allocator,
            backends,
            bots,
            policy,
            audit,
        }
    }

    /// Policy in use.
    pub const fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// One pass over error and stuck slots as of `now_ms`.
    pub async fn run_once(&self, now_ms: u128) -> Result<RecoveryReport, SchedulerError> {
        let store = self.allocator.store();
        let stuck_ms = self.policy.stuck_threshold.as_millis();
        let mut candidates = store.list(&SlotFilter::status(SlotStatus::Error)).await?;
        candidates.extend(
            store
                .list(&SlotFilter::status(SlotStatus::Deploying))
                .await?
                .into_iter()
                .filter(|s| elapsed_ms(s.status_changed_at_ms, now_ms) > stuck_ms),
        );

        let mut report = RecoveryReport::default();
        for slot in candidates {
            report.examined += 1;
            if slot.recovery_attempts > self.policy.max_attempts {
                report.skipped += 1;
                continue;
            }
            if let Some(last) = slot.last_recovery_at_ms {
                let wait = self.policy.backoff.delay(slot.recovery_attempts).as_millis();
                if elapsed_ms(last, now_ms) < wait {
                    report.skipped += 1;
                    continue;
                }
            }

            match self.recover(&slot, now_ms).await {
                Ok(true) => report.recovered += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("{}: {e}", slot.name));
                    match self.record_failure(&slot, &e, now_ms).await {
                        Ok(true) => report.exhausted += 1,
                        Ok(false) => {}
                        Err(store_err) => {
                            tracing::error!(slot = %slot.name, error = %store_err, "failed to record recovery attempt");
                        }
                    }
                }
            }
        }
        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                recovered = report.recovered,
                failed = report.failed,
                exhausted = report.exhausted,
                "recovery pass finished"
            );
        }
        Ok(report)
    }

    /// `Ok(false)` when the slot changed state before recovery could take it.
    async fn recover(&self, slot: &Slot, now_ms: u128) -> Result<bool, SchedulerError> {
        let store = self.allocator.store();
        let slot = if slot.status == SlotStatus::Deploying {
            let Some(taken) = store
                .update_if(
                    slot.id,
                    &[SlotStatus::Deploying],
                    slot.assigned_bot.as_deref(),
                    &SlotPatch::error("stuck in deploying"),
                    now_ms,
                )
                .await?
            else {
                return Ok(false);
            };
            if let Some(bot_id) = &slot.assigned_bot {
                tracing::warn!(bot_id = %bot_id, slot = %slot.name, "failing bot stuck in deploying");
                self.bots
                    .mark_terminal(bot_id, BotTerminalStatus::Failed, Some("deploy stuck".into()))
                    .await?;
            }
            taken
        } else {
            slot.clone()
        };

        let backend = self.backends.get(slot.backend)?;
        let status = backend.describe(&slot.instance).await?;
        let recovered = if status.is_gone() {
            self.recreate(backend.as_ref(), &slot, now_ms).await?
        } else {
            if let Err(e) = backend.stop(&slot.instance).await {
                tracing::warn!(slot = %slot.name, error = %e, "best-effort stop failed during recovery");
            }
            let patch = SlotPatch::idle(now_ms).with_recovery(0, None);
            store.update_if(slot.id, &[SlotStatus::Error], None, &patch, now_ms).await?
        };

        let Some(recovered) = recovered else {
            return Ok(false);
        };
        tracing::info!(slot = %recovered.name, instance = %recovered.instance, "slot recovered");
        audit::record(
            self.audit.as_ref(),
            recovered.id.to_string(),
            recovered.backend,
            None,
            AuditAction::Recover,
            Some(format!("instance was {status}")),
        );
        self.allocator.capacity_signal().notify_one();
        Ok(true)
    }

    /// New instance for the slot, under the inventory lock so reconciliation
    /// never sees it without its slot record.
    async fn recreate(&self, backend: &dyn PlatformBackend, slot: &Slot, now_ms: u128) -> Result<Option<Slot>, SchedulerError> {
        let lock = self.allocator.lock();
        let guard = lock
            .acquire(&slot.backend.inventory_lock_key(), self.allocator.lock_timeout())
            .await?;
        let result = self.recreate_locked(backend, slot, now_ms).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(backend = %slot.backend, error = %e, "failed to release inventory lock");
        }
        result
    }

    async fn recreate_locked(&self, backend: &dyn PlatformBackend, slot: &Slot, now_ms: u128) -> Result<Option<Slot>, SchedulerError> {
        let instance = backend.deploy(&DeployConfig::empty(slot.name.as_str())).await?;
        tracing::info!(slot = %slot.name, old = %slot.instance, new = %instance, "recreated slot instance");
        let patch = SlotPatch::idle(now_ms)
            .with_instance(instance)
            .with_recovery(0, None);
        self.allocator
            .store()
            .update_if(slot.id, &[SlotStatus::Error], None, &patch, now_ms)
            .await
    }

    /// Bump the attempt counter. Returns whether the slot is now exhausted.
    async fn record_failure(&self, slot: &Slot, err: &SchedulerError, now_ms: u128) -> Result<bool, SchedulerError> {
        let attempts = slot.recovery_attempts + 1;
        let exhausted = attempts > self.policy.max_attempts;
        let message = if exhausted {
            SchedulerError::RecoveryExhausted(slot.name.clone()).to_string()
        } else {
            format!("recovery attempt {attempts} failed: {err}")
        };
        let patch = SlotPatch {
            error_message: Some(Some(message)),
            ..SlotPatch::default()
        }
        .with_recovery(attempts, Some(now_ms));
        self.allocator
            .store()
            .update_if(slot.id, &[SlotStatus::Error], None, &patch, now_ms)
            .await?;

        if exhausted {
            tracing::error!(slot = %slot.name, attempts, error = %err, "slot recovery exhausted; operator action needed");
            audit::record(
                self.audit.as_ref(),
                slot.id.to_string(),
                slot.backend,
                None,
                AuditAction::RecoveryExhausted,
                Some(err.to_string()),
            );
        } else {
            tracing::warn!(slot = %slot.name, attempts, error = %err, "slot recovery attempt failed");
        }
        Ok(exhausted)
    }

    /// Run passes until `shutdown` flips or its sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.policy.interval, "recovery worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(now_ms()).await {
                        tracing::error!(error = %e, "recovery pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("recovery worker stopped");
    }
}
