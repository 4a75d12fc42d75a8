//! Slot state machine.
//!
//! ```text
//! idle --claim--> deploying --mark_busy--> busy
//!   ^                 |                     |
//!   +----release------+---------------------+
//!   ^                 |                     |
//!   +--release-- error <----mark_error------+
//! ```
//!
//! Claims run under the backend's advisory lock; every other transition is a
//! compare-and-set on the slot's status.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::audit::{self, AuditAction, SharedAudit};
use crate::core::backend::{DeployConfig, PlatformBackend};
use crate::core::lock::{AdvisoryLock, LockGuard};
use crate::core::model::{InstanceRef, Slot, SlotFilter, SlotPatch, SlotStatus};
use crate::core::{SchedulerError, SlotStore};
use crate::util::clock::now_ms;
use crate::util::serde::{BackendKind, BotId, SlotId};

/// Claims, releases and fails slots.
#[derive(Clone)]
pub struct SlotAllocator {
    slots: Arc<dyn SlotStore>,
    lock: AdvisoryLock,
    lock_timeout: Duration,
    capacity: Arc<Notify>,
    audit: Option<SharedAudit>,
}

impl SlotAllocator {
    /// Allocator over `slots`, serializing claims through `lock`.
    pub fn new(slots: Arc<dyn SlotStore>, lock: AdvisoryLock, lock_timeout: Duration) -> Self {
        Self {
            slots,
            lock,
            lock_timeout,
            capacity: Arc::new(Notify::new()),
            audit: None,
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAudit) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Slot table.
    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.slots
    }

    /// Advisory lock shared with recovery and reconciliation.
    pub const fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }

    /// How long lock acquisition may block.
    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Signalled whenever a slot goes back to idle.
    pub fn capacity_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.capacity)
    }

    /// Claim the least recently used idle slot on `backend` for `bot_id`.
    pub async fn claim(&self, backend: BackendKind, bot_id: &str) -> Result<SlotLease, SchedulerError> {
        let guard = self
            .lock
            .acquire(&backend.pool_lock_key(), self.lock_timeout)
            .await?;
        let claimed = self.claim_locked(backend, bot_id).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(%backend, error = %e, "failed to release pool lock");
        }

        let slot = claimed?;
        tracing::info!(bot_id, slot = %slot.name, %backend, "slot claimed");
        audit::record(self.audit.as_ref(), slot.id.to_string(), backend, Some(bot_id), AuditAction::Claim, Some(slot.name.clone()));
        Ok(SlotLease {
            allocator: self.clone(),
            bot_id: bot_id.to_owned(),
            slot,
            armed: true,
        })
    }

    async fn claim_locked(&self, backend: BackendKind, bot_id: &str) -> Result<Slot, SchedulerError> {
        if !self.slots.list(&SlotFilter::bot(bot_id)).await?.is_empty() {
            return Err(SchedulerError::AlreadyAssigned(bot_id.to_owned()));
        }

        let mut idle = self.slots.list(&SlotFilter::status(SlotStatus::Idle).on(backend)).await?;
        // Stable: ties keep the store's oldest-first order.
        idle.sort_by_key(|s| s.last_used_at_ms);

        let patch = SlotPatch::deploying(bot_id);
        for candidate in idle {
            if let Some(slot) = self
                .slots
                .update_if(candidate.id, &[SlotStatus::Idle], None, &patch, now_ms())
                .await?
            {
                return Ok(slot);
            }
            tracing::debug!(slot = %candidate.name, "idle slot changed under us, trying next");
        }
        Err(SchedulerError::NoneAvailable(backend.to_string()))
    }

    /// deploying → busy, only while `bot_id` still holds the slot.
    pub async fn mark_busy(&self, id: SlotId, bot_id: &str) -> Result<Slot, SchedulerError> {
        let slot = self
            .transition(id, &[SlotStatus::Deploying], Some(bot_id), &SlotPatch::busy())
            .await?;
        audit::record(self.audit.as_ref(), id.to_string(), slot.backend, Some(bot_id), AuditAction::Busy, None);
        Ok(slot)
    }

    /// Record the instance a deploy produced on a slot `bot_id` is deploying to.
    pub async fn set_instance(&self, id: SlotId, bot_id: &str, instance: InstanceRef) -> Result<Slot, SchedulerError> {
        let patch = SlotPatch {
            instance: Some(instance),
            ..SlotPatch::default()
        };
        self.transition(id, &[SlotStatus::Deploying], Some(bot_id), &patch).await
    }

    /// busy, deploying or error → idle, whoever holds the slot. Releasing an
    /// idle or deleted slot is a no-op and returns `None`.
    pub async fn release(&self, id: SlotId) -> Result<Option<Slot>, SchedulerError> {
        self.release_if(id, None).await
    }

    /// Like [`SlotAllocator::release`], but only while `bot_id` holds the
    /// slot. A slot that has since passed to another bot is left alone and
    /// reported as [`SchedulerError::InvalidTransition`].
    pub async fn release_held(&self, id: SlotId, bot_id: &str) -> Result<Option<Slot>, SchedulerError> {
        self.release_if(id, Some(bot_id)).await
    }

    async fn release_if(&self, id: SlotId, owner: Option<&str>) -> Result<Option<Slot>, SchedulerError> {
        let released = self
            .slots
            .update_if(
                id,
                &[SlotStatus::Busy, SlotStatus::Deploying, SlotStatus::Error],
                owner,
                &SlotPatch::idle(now_ms()),
                now_ms(),
            )
            .await?;
        match &released {
            Some(slot) => {
                tracing::info!(slot = %slot.name, backend = %slot.backend, "slot released");
                audit::record(self.audit.as_ref(), id.to_string(), slot.backend, owner, AuditAction::Release, None);
                self.capacity.notify_one();
            }
            None => {
                if let Some(bot_id) = owner {
                    if let Some(current) = self.slots.get(id).await? {
                        if let Some(holder) = current.assigned_bot.filter(|holder| holder != bot_id) {
                            return Err(SchedulerError::InvalidTransition(format!(
                                "slot {} is held by {holder}, not {bot_id}",
                                current.name
                            )));
                        }
                    }
                }
                tracing::debug!(slot = %id, "release skipped; slot already idle or gone");
            }
        }
        Ok(released)
    }

    /// Any state → error. The recovery counter is left alone.
    pub async fn mark_error(&self, id: SlotId, message: &str) -> Result<Slot, SchedulerError> {
        self.mark_error_if(id, None, message).await
    }

    /// Any state → error, only while `bot_id` holds the slot.
    pub async fn mark_error_held(&self, id: SlotId, bot_id: &str, message: &str) -> Result<Slot, SchedulerError> {
        self.mark_error_if(id, Some(bot_id), message).await
    }

    async fn mark_error_if(&self, id: SlotId, owner: Option<&str>, message: &str) -> Result<Slot, SchedulerError> {
        let slot = self
            .transition(id, &SlotStatus::ALL, owner, &SlotPatch::error(message))
            .await?;
        tracing::warn!(slot = %slot.name, backend = %slot.backend, message, "slot marked error");
        audit::record(self.audit.as_ref(), id.to_string(), slot.backend, owner, AuditAction::Error, Some(message.to_owned()));
        Ok(slot)
    }

    /// Slot currently held by `bot_id`.
    pub async fn find_by_bot(&self, bot_id: &str) -> Result<Option<Slot>, SchedulerError> {
        Ok(self.slots.list(&SlotFilter::bot(bot_id)).await?.into_iter().next())
    }

    /// Create `count` idle slots on `backend`, each backed by a freshly
    /// deployed empty instance. Names continue after the highest existing
    /// `<platform>-slot-<n>`.
    pub async fn provision(&self, backend: &dyn PlatformBackend, count: usize) -> Result<Vec<Slot>, SchedulerError> {
        let kind = backend.kind();
        let guard = self
            .lock
            .acquire(&kind.inventory_lock_key(), self.lock_timeout)
            .await?;
        let created = self.provision_locked(backend, count, &guard).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(backend = %kind, error = %e, "failed to release inventory lock");
        }
        if let Ok(slots) = &created {
            if !slots.is_empty() {
                self.capacity.notify_one();
            }
        }
        created
    }

    async fn provision_locked(
        &self,
        backend: &dyn PlatformBackend,
        count: usize,
        guard: &LockGuard,
    ) -> Result<Vec<Slot>, SchedulerError> {
        let kind = backend.kind();
        let prefix = format!("{}-slot-", kind.platform_label());
        let highest = self
            .slots
            .list(&SlotFilter::all().on(kind))
            .await?
            .iter()
            .filter_map(|s| s.name.strip_prefix(&prefix)?.parse::<usize>().ok())
            .max()
            .unwrap_or(0);

        let mut created = Vec::with_capacity(count);
        for n in (highest + 1)..=(highest + count) {
            guard.renew().await?;
            let name = Slot::slot_name(kind, n);
            let instance = backend.deploy(&DeployConfig::empty(name.as_str())).await?;
            let slot = Slot::new(name, kind, instance, now_ms());
            self.slots.insert(slot.clone()).await?;
            tracing::info!(slot = %slot.name, instance = %slot.instance, "slot provisioned");
            audit::record(self.audit.as_ref(), slot.id.to_string(), kind, None, AuditAction::Provision, Some(slot.name.clone()));
            created.push(slot);
        }
        Ok(created)
    }

    async fn transition(
        &self,
        id: SlotId,
        expected: &[SlotStatus],
        owner: Option<&str>,
        patch: &SlotPatch,
    ) -> Result<Slot, SchedulerError> {
        if let Some(slot) = self.slots.update_if(id, expected, owner, patch, now_ms()).await? {
            return Ok(slot);
        }
        match self.slots.get(id).await? {
            None => Err(SchedulerError::NotFound(format!("slot {id}"))),
            Some(slot) => match owner {
                Some(bot_id) if slot.assigned_bot.as_deref() != Some(bot_id) => {
                    Err(SchedulerError::InvalidTransition(format!(
                        "slot {} is held by {}, not {bot_id}",
                        slot.name,
                        slot.assigned_bot.as_deref().unwrap_or("nobody")
                    )))
                }
                _ => Err(SchedulerError::InvalidTransition(format!(
                    "slot {} is {}, expected one of {expected:?}",
                    slot.name, slot.status
                ))),
            },
        }
    }
}

/// A claimed slot. Unless handed off with [`SlotLease::into_assignment`] or
/// resolved with [`SlotLease::release`] / [`SlotLease::fail`], dropping the
/// lease (including during a panic) returns the slot to idle.
///
/// Every transition made through the lease checks that the slot is still
/// assigned to the lease's bot, so a lease outlived by recovery cannot touch
/// the slot's next owner.
pub struct SlotLease {
    allocator: SlotAllocator,
    bot_id: BotId,
    slot: Slot,
    armed: bool,
}

impl SlotLease {
    /// The claimed slot as last seen.
    pub const fn slot(&self) -> &Slot {
        &self.slot
    }

    /// Bot the slot was claimed for.
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Whether the slot is still assigned to this lease's bot.
    pub async fn is_held(&self) -> Result<bool, SchedulerError> {
        Ok(self
            .allocator
            .store()
            .get(self.slot.id)
            .await?
            .is_some_and(|s| s.assigned_bot.as_deref() == Some(self.bot_id.as_str())))
    }

    /// Record the deployed instance.
    pub async fn set_instance(&mut self, instance: InstanceRef) -> Result<(), SchedulerError> {
        if instance != self.slot.instance {
            self.slot = self
                .allocator
                .set_instance(self.slot.id, &self.bot_id, instance)
                .await?;
        }
        Ok(())
    }

    /// deploying → busy.
    pub async fn mark_busy(&mut self) -> Result<(), SchedulerError> {
        self.slot = self.allocator.mark_busy(self.slot.id, &self.bot_id).await?;
        Ok(())
    }

    /// Give the slot back.
    pub async fn release(mut self) -> Result<(), SchedulerError> {
        self.armed = false;
        self.allocator
            .release_held(self.slot.id, &self.bot_id)
            .await
            .map(|_| ())
    }

    /// Park the slot in error for the recovery worker.
    pub async fn fail(mut self, message: &str) -> Result<(), SchedulerError> {
        self.armed = false;
        self.allocator
            .mark_error_held(self.slot.id, &self.bot_id, message)
            .await
            .map(|_| ())
    }

    /// Let go of a slot that another party has already taken over, without
    /// touching it.
    pub fn abandon(mut self) {
        self.armed = false;
    }

    /// The bot now owns the slot; it is released by `finish`, the heartbeat
    /// monitor or an operator.
    pub fn into_assignment(mut self) -> Slot {
        self.armed = false;
        self.slot.clone()
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let allocator = self.allocator.clone();
        let id = self.slot.id;
        let bot_id = std::mem::take(&mut self.bot_id);
        let name = self.slot.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(slot = %name, "slot lease dropped without release; releasing");
                handle.spawn(async move {
                    if let Err(e) = allocator.release_held(id, &bot_id).await {
                        tracing::error!(slot = %name, error = %e, "failed to release dropped lease");
                    }
                });
            }
            Err(_) => tracing::error!(slot = %name, "slot lease dropped outside a runtime; left for recovery"),
        }
    }
}
