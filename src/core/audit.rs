//! Audit trail for slot and queue lifecycle events.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::now_ms;
use crate::util::serde::BackendKind;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Slot created by provisioning.
    Provision,
    /// Idle slot claimed for a bot.
    Claim,
    /// Backend confirmed the bot's instance is running.
    Busy,
    /// Slot returned to idle.
    Release,
    /// Slot moved to error.
    Error,
    /// Request parked in the queue.
    Enqueue,
    /// Queued request admitted.
    Admit,
    /// Queued request timed out.
    Expire,
    /// Queued request withdrawn.
    Cancel,
    /// Bot missed its heartbeat deadline.
    HeartbeatLost,
    /// Slot recovered to idle.
    Recover,
    /// Slot recovery gave up.
    RecoveryExhausted,
    /// Backend instance without a slot deleted.
    DeleteBackendOrphan,
    /// Slot without a backend instance deleted.
    DeleteLocalOrphan,
    /// Slot deleted by an operator.
    DeleteSlot,
}

impl AuditAction {
    /// Stable name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Claim => "claim",
            Self::Busy => "busy",
            Self::Release => "release",
            Self::Error => "error",
            Self::Enqueue => "enqueue",
            Self::Admit => "admit",
            Self::Expire => "expire",
            Self::Cancel => "cancel",
            Self::HeartbeatLost => "heartbeat_lost",
            Self::Recover => "recover",
            Self::RecoveryExhausted => "recovery_exhausted",
            Self::DeleteBackendOrphan => "delete_backend_orphan",
            Self::DeleteLocalOrphan => "delete_local_orphan",
            Self::DeleteSlot => "delete_slot",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Slot id, slot name, instance id or bot id the event is about.
    pub subject: String,
    /// Backend involved.
    pub backend: BackendKind,
    /// Bot involved, if any.
    pub bot_id: Option<String>,
    /// Action taken.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// Shared handle to an audit sink.
pub type SharedAudit = Arc<dyn AuditSink>;

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events with the given action, oldest first.
    pub fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    subject: impl Into<String>,
    backend: BackendKind,
    bot_id: Option<&str>,
    action: AuditAction,
    detail: Option<String>,
) -> AuditEvent {
    let subject = subject.into();
    let created_at_ms = now_ms();
    AuditEvent {
        event_id: format!("{subject}-{action}-{}", uuid::Uuid::new_v4().simple()),
        subject,
        backend,
        bot_id: bot_id.map(str::to_owned),
        action,
        created_at_ms,
        detail,
    }
}

/// Record into an optional sink.
pub(crate) fn record(
    audit: Option<&SharedAudit>,
    subject: impl Into<String>,
    backend: BackendKind,
    bot_id: Option<&str>,
    action: AuditAction,
    detail: Option<String>,
) {
    if let Some(sink) = audit {
        sink.record(build_audit_event(subject, backend, bot_id, action, detail));
    }
}
