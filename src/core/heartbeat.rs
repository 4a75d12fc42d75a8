//! Liveness tracking for deployed bots.
//!
//! Bots report in through [`HeartbeatMonitor::beat`]. A sweep fails every
//! bot whose last signal is strictly older than the timeout: its slot goes
//! back to idle and its record is marked failed. The sweep never talks to a
//! backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::core::allocator::SlotAllocator;
use crate::core::audit::{self, AuditAction, SharedAudit};
use crate::core::model::BotTerminalStatus;
use crate::core::{BotRegistry, SchedulerError};
use crate::util::clock::{elapsed_ms, now_ms};
use crate::util::serde::BotId;

/// Heartbeat cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTiming {
    /// How often bots are expected to report.
    pub interval: Duration,
    /// Silence after which a bot is considered dead.
    pub timeout: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for HeartbeatTiming {
    fn default() -> Self {
        let interval = Duration::from_secs(10);
        Self {
            interval,
            timeout: Duration::from_secs(30),
            sweep_interval: interval * 2,
        }
    }
}

/// Last-seen map plus the sweep that acts on it.
pub struct HeartbeatMonitor {
    last_seen: Mutex<HashMap<BotId, u128>>,
    timing: HeartbeatTiming,
    allocator: SlotAllocator,
    bots: Arc<dyn BotRegistry>,
    audit: Option<SharedAudit>,
}

impl HeartbeatMonitor {
    /// Monitor releasing slots through `allocator` and reporting to `bots`.
    pub fn new(
        timing: HeartbeatTiming,
        allocator: SlotAllocator,
        bots: Arc<dyn BotRegistry>,
        audit: Option<SharedAudit>,
    ) -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
            timing,
            allocator,
            bots,
            audit,
        }
    }

    /// Cadence in use.
    pub const fn timing(&self) -> HeartbeatTiming {
        self.timing
    }

    /// Start watching `bot_id` as of `now_ms`.
    pub fn track(&self, bot_id: &str, now_ms: u128) {
        self.last_seen.lock().insert(bot_id.to_owned(), now_ms);
    }

    /// Stop watching `bot_id`. Returns whether it was tracked.
    pub fn untrack(&self, bot_id: &str) -> bool {
        self.last_seen.lock().remove(bot_id).is_some()
    }

    /// Refresh a tracked bot. Returns `false` for bots this monitor does not
    /// track.
    pub fn beat_at(&self, bot_id: &str, now_ms: u128) -> bool {
        match self.last_seen.lock().get_mut(bot_id) {
            Some(last) => {
                *last = (*last).max(now_ms);
                true
            }
            None => false,
        }
    }

    /// Liveness signal. A bot deployed by another scheduler instance is
    /// adopted if it holds a slot; signals from bots without a slot are
    /// ignored.
    pub async fn beat(&self, bot_id: &str) -> Result<bool, SchedulerError> {
        let now = now_ms();
        if self.beat_at(bot_id, now) {
            return Ok(true);
        }
        if self.allocator.find_by_bot(bot_id).await?.is_some() {
            tracing::debug!(bot_id, "adopting heartbeat for bot deployed elsewhere");
            self.track(bot_id, now);
            return Ok(true);
        }
        tracing::debug!(bot_id, "ignoring heartbeat from bot without a slot");
        Ok(false)
    }

    /// Bots currently tracked.
    pub fn tracked(&self) -> Vec<BotId> {
        let mut bots: Vec<BotId> = self.last_seen.lock().keys().cloned().collect();
        bots.sort();
        bots
    }

    /// Last signal from `bot_id`.
    pub fn last_seen(&self, bot_id: &str) -> Option<u128> {
        self.last_seen.lock().get(bot_id).copied()
    }

    /// Fail every bot silent for longer than the timeout. Returns the bots
    /// failed by this sweep.
    pub async fn sweep(&self, now_ms: u128) -> Vec<BotId> {
        let timeout_ms = self.timing.timeout.as_millis();
        let expired: Vec<(BotId, u128)> = self
            .last_seen
            .lock()
            .iter()
            .filter(|(_, last)| elapsed_ms(**last, now_ms) > timeout_ms)
            .map(|(bot, last)| (bot.clone(), *last))
            .collect();

        let mut failed = Vec::with_capacity(expired.len());
        for (bot_id, last) in expired {
            {
                let mut map = self.last_seen.lock();
                // A beat may have landed since the scan.
                if map.get(&bot_id) != Some(&last) {
                    continue;
                }
                map.remove(&bot_id);
            }
            let silent_ms = elapsed_ms(last, now_ms);
            tracing::warn!(bot_id = %bot_id, silent_ms = %silent_ms, "bot missed heartbeat deadline");
            if let Err(e) = self.fail_bot(&bot_id, silent_ms).await {
                tracing::error!(bot_id = %bot_id, error = %e, "failed to clean up unresponsive bot");
            }
            failed.push(bot_id);
        }
        failed
    }

    async fn fail_bot(&self, bot_id: &str, silent_ms: u128) -> Result<(), SchedulerError> {
        let reason = format!("no heartbeat for {silent_ms}ms");
        let slot = self.allocator.find_by_bot(bot_id).await?;
        if let Some(slot) = &slot {
            self.allocator.release_held(slot.id, bot_id).await?;
            audit::record(
                self.audit.as_ref(),
                slot.id.to_string(),
                slot.backend,
                Some(bot_id),
                AuditAction::HeartbeatLost,
                Some(reason.clone()),
            );
        }
        self.bots
            .mark_terminal(bot_id, BotTerminalStatus::Failed, Some(reason))
            .await
    }

    /// Sweep on a timer until `shutdown` flips or its sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.timing.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.timing.sweep_interval, "heartbeat sweep started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let failed = self.sweep(now_ms()).await;
                    if !failed.is_empty() {
                        tracing::info!(count = failed.len(), "heartbeat sweep failed bots");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("heartbeat sweep stopped");
    }
}
