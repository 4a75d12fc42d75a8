//! Persistence seams.
//!
//! The scheduler consumes the relational store only through these traits.
//! Implementations live under `crate::infra`.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::model::{BotTerminalStatus, QueueEntry, Slot, SlotFilter, SlotPatch, SlotStatus};
use crate::core::SchedulerError;
use crate::util::serde::{BackendKind, SlotId};

/// Slot table.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Insert a new slot. Fails if the id or name already exists.
    async fn insert(&self, slot: Slot) -> Result<(), SchedulerError>;

    /// Fetch a slot by id.
    async fn get(&self, id: SlotId) -> Result<Option<Slot>, SchedulerError>;

    /// Slots matching `filter`, oldest first (creation time, then natural
    /// name order so `slot-2` sorts before `slot-10`).
    async fn list(&self, filter: &SlotFilter) -> Result<Vec<Slot>, SchedulerError>;

    /// Compare-and-set: apply `patch` only if the slot's current status is
    /// one of `expected` and, when `owner` is given, the slot is assigned to
    /// that bot. Returns the updated row, or `None` if the slot is missing or
    /// did not match.
    async fn update_if(
        &self,
        id: SlotId,
        expected: &[SlotStatus],
        owner: Option<&str>,
        patch: &SlotPatch,
        now_ms: u128,
    ) -> Result<Option<Slot>, SchedulerError>;

    /// Delete a slot. Returns whether a row was removed.
    async fn delete(&self, id: SlotId) -> Result<bool, SchedulerError>;
}

/// Queue table.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert an entry, assigning its sequence number. Fails with
    /// [`SchedulerError::DuplicateRequest`] if the bot already has one.
    async fn push(&self, entry: QueueEntry) -> Result<QueueEntry, SchedulerError>;

    /// Remove the entry for `bot_id`. Only one concurrent caller gets `Some`.
    async fn remove(&self, bot_id: &str) -> Result<Option<QueueEntry>, SchedulerError>;

    /// Entries in dispatch order (priority, enqueue time, sequence),
    /// optionally restricted to one backend.
    async fn list(&self, backend: Option<BackendKind>) -> Result<Vec<QueueEntry>, SchedulerError>;

    /// Whether `bot_id` has an entry.
    async fn contains(&self, bot_id: &str) -> Result<bool, SchedulerError>;

    /// Number of entries.
    async fn len(&self) -> Result<usize, SchedulerError>;
}

/// Named lease table backing the advisory lock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `owner` until `ttl` elapses. Returns `false` if another
    /// owner holds an unexpired lease. Re-acquiring one's own lease extends it.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration)
        -> Result<bool, SchedulerError>;

    /// Drop `owner`'s lease on `key`. Releasing a lease one does not hold is a no-op.
    async fn release(&self, key: &str, owner: &str) -> Result<(), SchedulerError>;
}

/// Bot records owned by the surrounding application.
#[async_trait]
pub trait BotRegistry: Send + Sync {
    /// Record the bot's final state.
    async fn mark_terminal(
        &self,
        bot_id: &str,
        status: BotTerminalStatus,
        reason: Option<String>,
    ) -> Result<(), SchedulerError>;
}
