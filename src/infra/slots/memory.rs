//! In-memory slot table.
//!
//! Every scheduler handle holding the same `Arc<InMemorySlotStore>` sees the
//! same rows, which is how tests model several scheduler instances sharing
//! one database.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::model::{Slot, SlotFilter, SlotPatch, SlotStatus};
use crate::core::{SchedulerError, SlotStore};
use crate::util::serde::SlotId;

/// Slot rows behind a mutex. Each operation is a single critical section, so
/// `update_if` is a true compare-and-set.
#[derive(Default)]
pub struct InMemorySlotStore {
    slots: Mutex<HashMap<SlotId, Slot>>,
}

impl InMemorySlotStore {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for InMemorySlotStore {
    async fn insert(&self, slot: Slot) -> Result<(), SchedulerError> {
        let mut slots = self.slots.lock();
        if slots.contains_key(&slot.id) || slots.values().any(|s| s.name == slot.name) {
            return Err(SchedulerError::Store(format!("slot {} already exists", slot.name)));
        }
        slots.insert(slot.id, slot);
        Ok(())
    }

    async fn get(&self, id: SlotId) -> Result<Option<Slot>, SchedulerError> {
        Ok(self.slots.lock().get(&id).cloned())
    }

    async fn list(&self, filter: &SlotFilter) -> Result<Vec<Slot>, SchedulerError> {
        let mut out: Vec<Slot> = self
            .slots
            .lock()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.name.len().cmp(&b.name.len()))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(out)
    }

    async fn update_if(
        &self,
        id: SlotId,
        expected: &[SlotStatus],
        owner: Option<&str>,
        patch: &SlotPatch,
        now_ms: u128,
    ) -> Result<Option<Slot>, SchedulerError> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&id) else {
            return Ok(None);
        };
        if !expected.contains(&slot.status) {
            return Ok(None);
        }
        if owner.is_some_and(|bot| slot.assigned_bot.as_deref() != Some(bot)) {
            return Ok(None);
        }
        patch.apply(slot, now_ms);
        Ok(Some(slot.clone()))
    }

    async fn delete(&self, id: SlotId) -> Result<bool, SchedulerError> {
        Ok(self.slots.lock().remove(&id).is_some())
    }
}
