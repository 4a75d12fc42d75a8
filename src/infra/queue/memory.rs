//! In-memory queue table with priority and FIFO ordering.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::QueueState;
use crate::core::model::QueueEntry;
use crate::core::{QueueStore, SchedulerError};
use crate::util::serde::BackendKind;

/// In-memory queue ordered by (priority, enqueue time, sequence).
/// Lookups by bot and ordered scans are both O(log n).
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueue {
    async fn push(&self, entry: QueueEntry) -> Result<QueueEntry, SchedulerError> {
        self.state.lock().push(entry)
    }

    async fn remove(&self, bot_id: &str) -> Result<Option<QueueEntry>, SchedulerError> {
        Ok(self.state.lock().remove(bot_id))
    }

    async fn list(&self, backend: Option<BackendKind>) -> Result<Vec<QueueEntry>, SchedulerError> {
        Ok(self.state.lock().list(backend))
    }

    async fn contains(&self, bot_id: &str) -> Result<bool, SchedulerError> {
        Ok(self.state.lock().contains(bot_id))
    }

    async fn len(&self) -> Result<usize, SchedulerError> {
        Ok(self.state.lock().len())
    }
}
