//! Queue table backends.

pub mod memory;
pub mod yaque;

pub use memory::InMemoryQueue;
pub use yaque::YaqueQueue;

use std::collections::{BTreeMap, HashMap};

use crate::core::model::QueueEntry;
use crate::core::SchedulerError;
use crate::util::serde::{BackendKind, BotId, Priority};

type OrderKey = (Priority, u128, u64);

/// Ordered entries plus a bot index. Shared by the memory and file backends.
#[derive(Default)]
pub(crate) struct QueueState {
    ordered: BTreeMap<OrderKey, QueueEntry>,
    by_bot: HashMap<BotId, OrderKey>,
    next_sequence: u64,
}

impl QueueState {
    pub(crate) fn push(&mut self, mut entry: QueueEntry) -> Result<QueueEntry, SchedulerError> {
        if self.by_bot.contains_key(&entry.bot_id) {
            return Err(SchedulerError::DuplicateRequest(entry.bot_id));
        }
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        self.insert(entry.clone());
        Ok(entry)
    }

    pub(crate) fn restore(&mut self, entry: QueueEntry) -> Result<(), SchedulerError> {
        if self.by_bot.contains_key(&entry.bot_id) {
            return Err(SchedulerError::DuplicateRequest(entry.bot_id));
        }
        self.next_sequence = self.next_sequence.max(entry.sequence);
        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, entry: QueueEntry) {
        let key = entry.order_key();
        self.by_bot.insert(entry.bot_id.clone(), key);
        self.ordered.insert(key, entry);
    }

    pub(crate) fn remove(&mut self, bot_id: &str) -> Option<QueueEntry> {
        let key = self.by_bot.remove(bot_id)?;
        self.ordered.remove(&key)
    }

    pub(crate) fn list(&self, backend: Option<BackendKind>) -> Vec<QueueEntry> {
        self.ordered
            .values()
            .filter(|e| backend.is_none_or(|b| b == e.backend))
            .cloned()
            .collect()
    }

    pub(crate) fn contains(&self, bot_id: &str) -> bool {
        self.by_bot.contains_key(bot_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ordered.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.ordered.values()
    }
}
