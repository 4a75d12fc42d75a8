//! In-memory bot records for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::model::BotTerminalStatus;
use crate::core::{BotRegistry, SchedulerError};
use crate::util::serde::BotId;

/// Terminal state plus reason, keyed by bot.
#[derive(Default)]
pub struct InMemoryBotRegistry {
    records: Mutex<HashMap<BotId, (BotTerminalStatus, Option<String>)>>,
}

impl InMemoryBotRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal status recorded for `bot_id`.
    pub fn status(&self, bot_id: &str) -> Option<BotTerminalStatus> {
        self.records.lock().get(bot_id).map(|(status, _)| *status)
    }

    /// Reason recorded with the terminal status.
    pub fn reason(&self, bot_id: &str) -> Option<String> {
        self.records.lock().get(bot_id).and_then(|(_, reason)| reason.clone())
    }
}

#[async_trait]
impl BotRegistry for InMemoryBotRegistry {
    async fn mark_terminal(
        &self,
        bot_id: &str,
        status: BotTerminalStatus,
        reason: Option<String>,
    ) -> Result<(), SchedulerError> {
        self.records.lock().insert(bot_id.to_owned(), (status, reason));
        Ok(())
    }
}
