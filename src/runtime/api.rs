//! Administrative operations and the liveness signal, with serde views for
//! whatever transport fronts them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::audit::{self, AuditAction};
use crate::core::{
    QueueEntry, ReconcileReport, Scheduler, SchedulerError, Slot, SlotFilter, SlotPatch, SlotStatus,
};
use crate::util::clock::now_ms;
use crate::util::serde::{BackendKind, BotId, Priority, SlotId};

/// Largest page `list_slots` returns.
pub const MAX_PER_PAGE: usize = 100;

/// Slot as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    /// Slot identifier.
    pub id: SlotId,
    /// `<platform>-slot-<n>`.
    pub name: String,
    /// Backend.
    pub backend: BackendKind,
    /// Backend instance.
    pub instance: String,
    /// Status.
    pub status: SlotStatus,
    /// Bot on the slot.
    pub assigned_bot: Option<BotId>,
    /// Last release.
    pub last_used_at_ms: u128,
    /// Last error.
    pub error_message: Option<String>,
    /// Failed recovery attempts.
    pub recovery_attempts: u32,
    /// Creation time.
    pub created_at_ms: u128,
}

impl From<Slot> for SlotView {
    fn from(slot: Slot) -> Self {
        Self {
            id: slot.id,
            name: slot.name,
            backend: slot.backend,
            instance: slot.instance.as_str().to_owned(),
            status: slot.status,
            assigned_bot: slot.assigned_bot,
            last_used_at_ms: slot.last_used_at_ms,
            error_message: slot.error_message,
            recovery_attempts: slot.recovery_attempts,
            created_at_ms: slot.created_at_ms,
        }
    }
}

/// One page of slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPage {
    /// Slots on this page.
    pub slots: Vec<SlotView>,
    /// 1-based page number.
    pub page: usize,
    /// Page size actually used.
    pub per_page: usize,
    /// Slots matching the filter across all pages.
    pub total: usize,
}

/// Outcome of `delete_slots`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSlotsReport {
    /// Slots removed from backend and table.
    pub deleted: Vec<SlotId>,
    /// Ids with no slot.
    pub not_found: Vec<SlotId>,
    /// Per-slot failures; those slots were kept.
    pub failures: Vec<String>,
}

/// Queue entry as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntryView {
    /// 1-based place in its backend's line.
    pub position: usize,
    /// Bot.
    pub bot_id: BotId,
    /// Backend the entry waits for.
    pub backend: BackendKind,
    /// Priority.
    pub priority: Priority,
    /// Enqueue time.
    pub enqueued_at_ms: u128,
    /// Deadline.
    pub timeout_at_ms: u128,
    /// Request summary.
    pub summary: String,
}

/// Queue listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueListing {
    /// Entries in dispatch order.
    pub entries: Vec<QueueEntryView>,
    /// Number of entries.
    pub total: usize,
}

/// Answer to a liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Bot.
    pub bot_id: BotId,
    /// Whether the bot is being watched.
    pub tracked: bool,
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Stores answered.
    pub ok: bool,
    /// Deployments running on this instance.
    pub in_flight: u32,
    /// Queue length.
    pub queued: usize,
    /// Slot count per status.
    pub slots: BTreeMap<String, usize>,
    /// Bots under heartbeat watch.
    pub tracked_bots: usize,
}

/// Slots filtered by `status`, oldest first, paginated. `page` is 1-based;
/// `per_page` is clamped to `1..=MAX_PER_PAGE`.
pub async fn list_slots(
    scheduler: &Scheduler,
    status: Option<SlotStatus>,
    page: usize,
    per_page: usize,
) -> Result<SlotPage, SchedulerError> {
    let filter = status.map_or_else(SlotFilter::all, SlotFilter::status);
    let slots = scheduler.allocator().store().list(&filter).await?;
    let page = page.max(1);
    let per_page = per_page.clamp(1, MAX_PER_PAGE);
    let total = slots.len();
    let slots = slots
        .into_iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .map(SlotView::from)
        .collect();
    Ok(SlotPage {
        slots,
        page,
        per_page,
        total,
    })
}

/// Delete slots by id: stop running instances first, delete the backend
/// instance (missing counts as deleted), then the slot record.
pub async fn delete_slots(scheduler: &Scheduler, ids: &[SlotId]) -> Result<DeleteSlotsReport, SchedulerError> {
    let mut report = DeleteSlotsReport::default();
    for &id in ids {
        match delete_slot(scheduler, id).await {
            Ok(true) => report.deleted.push(id),
            Ok(false) => report.not_found.push(id),
            Err(e) => {
                tracing::error!(slot_id = %id, error = %e, "failed to delete slot");
                report.failures.push(format!("{id}: {e}"));
            }
        }
    }
    Ok(report)
}

async fn delete_slot(scheduler: &Scheduler, id: SlotId) -> Result<bool, SchedulerError> {
    let store = scheduler.allocator().store();
    let Some(slot) = store.get(id).await? else {
        return Ok(false);
    };
    let backend = scheduler.backends().get(slot.backend)?;

    if slot.status.holds_bot() {
        if let Err(e) = backend.stop(&slot.instance).await {
            tracing::warn!(slot = %slot.name, error = %e, "stop before delete failed");
        }
        if let Some(bot_id) = &slot.assigned_bot {
            scheduler.heartbeats().untrack(bot_id);
        }
    } else {
        // Park free slots so nothing claims them while the instance goes away.
        let parked = store
            .update_if(
                id,
                &[SlotStatus::Idle, SlotStatus::Error],
                None,
                &SlotPatch::error("deleted by operator"),
                now_ms(),
            )
            .await?;
        if parked.is_none() {
            return Err(SchedulerError::InvalidTransition(format!(
                "slot {} changed state during delete",
                slot.name
            )));
        }
    }

    backend.delete(&slot.instance).await?;
    let removed = store.delete(id).await?;
    tracing::info!(slot = %slot.name, instance = %slot.instance, "slot deleted");
    audit::record(
        scheduler.audit(),
        id.to_string(),
        slot.backend,
        slot.assigned_bot.as_deref(),
        AuditAction::DeleteSlot,
        Some(slot.name.clone()),
    );
    Ok(removed)
}

/// Run reconciliation now.
pub async fn trigger_reconciliation(scheduler: &Scheduler) -> ReconcileReport {
    scheduler.reconcile().await
}

/// Queued requests in dispatch order, optionally for one backend.
pub async fn list_queue(scheduler: &Scheduler, backend: Option<BackendKind>) -> Result<QueueListing, SchedulerError> {
    let entries = scheduler.queue().entries(backend).await?;
    let mut positions: HashMap<BackendKind, usize> = HashMap::new();
    let entries: Vec<QueueEntryView> = entries
        .into_iter()
        .map(|entry: QueueEntry| {
            let position = positions.entry(entry.backend).or_insert(0);
            *position += 1;
            QueueEntryView {
                position: *position,
                summary: entry.request.summary(),
                bot_id: entry.bot_id,
                backend: entry.backend,
                priority: entry.priority,
                enqueued_at_ms: entry.enqueued_at_ms,
                timeout_at_ms: entry.timeout_at_ms,
            }
        })
        .collect();
    Ok(QueueListing {
        total: entries.len(),
        entries,
    })
}

/// Liveness signal from `bot_id`.
pub async fn heartbeat(scheduler: &Scheduler, bot_id: &str) -> Result<HeartbeatAck, SchedulerError> {
    let tracked = scheduler.heartbeat(bot_id).await?;
    Ok(HeartbeatAck {
        bot_id: bot_id.to_owned(),
        tracked,
    })
}

/// Return a health payload. Store failures report `ok: false` instead of
/// erroring.
pub async fn health(scheduler: &Scheduler) -> Health {
    let mut ok = true;
    let mut slots = BTreeMap::new();
    match scheduler.allocator().store().list(&SlotFilter::all()).await {
        Ok(all) => {
            for status in SlotStatus::ALL {
                slots.insert(status.as_str().to_owned(), 0);
            }
            for slot in all {
                *slots.entry(slot.status.as_str().to_owned()).or_insert(0) += 1;
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "health check: slot store failed");
            ok = false;
        }
    }
    let queued = match scheduler.queue().entries(None).await {
        Ok(entries) => entries.len(),
        Err(e) => {
            tracing::warn!(error = %e, "health check: queue store failed");
            ok = false;
            0
        }
    };
    Health {
        ok,
        in_flight: scheduler.queue().in_flight(),
        queued,
        slots,
        tracked_bots: scheduler.heartbeats().tracked().len(),
    }
}
