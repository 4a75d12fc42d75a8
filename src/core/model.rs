//! Slot, queue and request records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;
use crate::util::serde::{BackendKind, BotId, Priority, SlotId};

/// Opaque backend-assigned reference to an instance (container, service, process).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceRef(String);

impl InstanceRef {
    /// Wrap a backend identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Backend identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Free for a new bot.
    Idle,
    /// Claimed; the bot's instance is being started.
    Deploying,
    /// Running a bot.
    Busy,
    /// Broken; waiting for recovery or an operator.
    Error,
}

impl SlotStatus {
    /// Every status, for filters that accept any.
    pub const ALL: [Self; 4] = [Self::Idle, Self::Deploying, Self::Busy, Self::Error];

    /// Whether a slot in this status carries an assigned bot.
    pub const fn holds_bot(self) -> bool {
        matches!(self, Self::Deploying | Self::Busy)
    }

    /// Stable name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Deploying => "deploying",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned, reusable execution unit bound to one backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot identifier.
    pub id: SlotId,
    /// Unique human-readable name, `<platform>-slot-<n>`.
    pub name: String,
    /// Backend the slot lives on.
    pub backend: BackendKind,
    /// Backend instance backing the slot.
    pub instance: InstanceRef,
    /// Lifecycle state.
    pub status: SlotStatus,
    /// Bot currently using the slot. Only set while deploying or busy.
    pub assigned_bot: Option<BotId>,
    /// Last time the slot was released, used to rotate usage.
    pub last_used_at_ms: u128,
    /// Last error, if the slot is or was in error.
    pub error_message: Option<String>,
    /// Consecutive failed recovery attempts.
    pub recovery_attempts: u32,
    /// Time of the last recovery attempt.
    pub last_recovery_at_ms: Option<u128>,
    /// Time of the last status change.
    pub status_changed_at_ms: u128,
    /// Creation time.
    pub created_at_ms: u128,
}

impl Slot {
    /// A fresh idle slot.
    pub fn new(
        name: impl Into<String>,
        backend: BackendKind,
        instance: InstanceRef,
        now_ms: u128,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            backend,
            instance,
            status: SlotStatus::Idle,
            assigned_bot: None,
            last_used_at_ms: 0,
            error_message: None,
            recovery_attempts: 0,
            last_recovery_at_ms: None,
            status_changed_at_ms: now_ms,
            created_at_ms: now_ms,
        }
    }

    /// Name of the `n`th slot on a backend.
    pub fn slot_name(backend: BackendKind, n: usize) -> String {
        format!("{}-slot-{n}", backend.platform_label())
    }
}

/// Partial update applied to a slot row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    /// New status.
    pub status: Option<SlotStatus>,
    /// New assigned bot (`Some(None)` clears it).
    pub assigned_bot: Option<Option<BotId>>,
    /// New backend instance.
    pub instance: Option<InstanceRef>,
    /// New last-used timestamp.
    pub last_used_at_ms: Option<u128>,
    /// New error message (`Some(None)` clears it).
    pub error_message: Option<Option<String>>,
    /// New recovery counter.
    pub recovery_attempts: Option<u32>,
    /// New last recovery timestamp (`Some(None)` clears it).
    pub last_recovery_at_ms: Option<Option<u128>>,
}

impl SlotPatch {
    /// idle → deploying for `bot_id`.
    pub fn deploying(bot_id: &str) -> Self {
        Self {
            status: Some(SlotStatus::Deploying),
            assigned_bot: Some(Some(bot_id.to_owned())),
            error_message: Some(None),
            ..Self::default()
        }
    }

    /// deploying → busy.
    pub fn busy() -> Self {
        Self {
            status: Some(SlotStatus::Busy),
            ..Self::default()
        }
    }

    /// Back to idle with no bot and no error.
    pub fn idle(now_ms: u128) -> Self {
        Self {
            status: Some(SlotStatus::Idle),
            assigned_bot: Some(None),
            last_used_at_ms: Some(now_ms),
            error_message: Some(None),
            ..Self::default()
        }
    }

    /// Into error with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(SlotStatus::Error),
            assigned_bot: Some(None),
            error_message: Some(Some(message.into())),
            ..Self::default()
        }
    }

    /// Also replace the backend instance.
    #[must_use]
    pub fn with_instance(mut self, instance: InstanceRef) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Also set the recovery bookkeeping.
    #[must_use]
    pub const fn with_recovery(mut self, attempts: u32, last_attempt_at_ms: Option<u128>) -> Self {
        self.recovery_attempts = Some(attempts);
        self.last_recovery_at_ms = Some(last_attempt_at_ms);
        self
    }

    /// Apply to a slot. A slot left outside deploying/busy never keeps a bot.
    pub fn apply(&self, slot: &mut Slot, now_ms: u128) {
        if let Some(status) = self.status {
            if slot.status != status {
                slot.status_changed_at_ms = now_ms;
            }
            slot.status = status;
        }
        if let Some(bot) = &self.assigned_bot {
            slot.assigned_bot.clone_from(bot);
        }
        if let Some(instance) = &self.instance {
            slot.instance = instance.clone();
        }
        if let Some(ts) = self.last_used_at_ms {
            slot.last_used_at_ms = ts;
        }
        if let Some(message) = &self.error_message {
            slot.error_message.clone_from(message);
        }
        if let Some(attempts) = self.recovery_attempts {
            slot.recovery_attempts = attempts;
        }
        if let Some(ts) = self.last_recovery_at_ms {
            slot.last_recovery_at_ms = ts;
        }
        if !slot.status.holds_bot() {
            slot.assigned_bot = None;
        }
    }
}

/// Slot query. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotFilter {
    /// Accepted statuses; empty accepts all.
    pub statuses: Vec<SlotStatus>,
    /// Backend to match.
    pub backend: Option<BackendKind>,
    /// Assigned bot to match.
    pub assigned_bot: Option<BotId>,
}

impl SlotFilter {
    /// Match any slot.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match a single status.
    pub fn status(status: SlotStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    /// Match the slot assigned to `bot_id`.
    pub fn bot(bot_id: &str) -> Self {
        Self {
            assigned_bot: Some(bot_id.to_owned()),
            ..Self::default()
        }
    }

    /// Restrict to a backend.
    #[must_use]
    pub const fn on(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Restrict to several statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: &[SlotStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Whether `slot` passes the filter.
    pub fn matches(&self, slot: &Slot) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&slot.status))
            && self.backend.is_none_or(|b| b == slot.backend)
            && self
                .assigned_bot
                .as_deref()
                .is_none_or(|bot| slot.assigned_bot.as_deref() == Some(bot))
    }
}

/// A bot plus what is needed to start it on a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Bot to deploy.
    pub bot_id: BotId,
    /// Explicit backend; the highest-priority configured backend when absent.
    #[serde(default)]
    pub backend: Option<BackendKind>,
    /// Queue priority.
    #[serde(default)]
    pub priority: Priority,
    /// Container image.
    #[serde(default)]
    pub image: Option<String>,
    /// Command override.
    #[serde(default)]
    pub command: Option<String>,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment passed to the bot.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl DeploymentRequest {
    /// Request with defaults for everything but the bot id.
    pub fn new(bot_id: impl Into<BotId>) -> Self {
        Self {
            bot_id: bot_id.into(),
            backend: None,
            priority: Priority::default(),
            image: None,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Target a backend.
    #[must_use]
    pub const fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the queue priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the container image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the command and its arguments.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>, args: &[&str]) -> Self {
        self.command = Some(command.into());
        self.args = args.iter().map(|a| (*a).to_owned()).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Reject requests that can never succeed.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.bot_id.trim().is_empty() {
            return Err(SchedulerError::ConfigInvalid("bot id must not be empty".into()));
        }
        if self.bot_id.chars().any(char::is_whitespace) {
            return Err(SchedulerError::ConfigInvalid(format!(
                "bot id `{}` must not contain whitespace",
                self.bot_id
            )));
        }
        if self.image.as_deref().is_some_and(|i| i.trim().is_empty()) {
            return Err(SchedulerError::ConfigInvalid(format!(
                "bot {}: image must not be empty",
                self.bot_id
            )));
        }
        Ok(())
    }

    /// One-line description for listings.
    pub fn summary(&self) -> String {
        let image = self.image.as_deref().unwrap_or("<default image>");
        let command = self.command.as_deref().unwrap_or("<default command>");
        format!("{} image={image} command={command} env={}", self.bot_id, self.env.len())
    }
}

/// A request waiting for capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Entry identifier.
    pub id: uuid::Uuid,
    /// Requesting bot; at most one entry per bot.
    pub bot_id: BotId,
    /// Backend the request waits for.
    pub backend: BackendKind,
    /// Priority, lower served first.
    pub priority: Priority,
    /// Enqueue time.
    pub enqueued_at_ms: u128,
    /// Deadline after which the entry fails with a queue timeout.
    pub timeout_at_ms: u128,
    /// Store-assigned FIFO tie-break.
    pub sequence: u64,
    /// The request itself, so it survives restarts.
    pub request: DeploymentRequest,
}

impl QueueEntry {
    /// Entry for `request` on `backend`. The store assigns `sequence`.
    pub fn new(
        request: DeploymentRequest,
        backend: BackendKind,
        enqueued_at_ms: u128,
        timeout_at_ms: u128,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            bot_id: request.bot_id.clone(),
            backend,
            priority: request.priority,
            enqueued_at_ms,
            timeout_at_ms,
            sequence: 0,
            request,
        }
    }

    /// Deadline reached or passed.
    pub const fn is_expired(&self, now_ms: u128) -> bool {
        now_ms >= self.timeout_at_ms
    }

    /// Dispatch order: priority, then enqueue time, then sequence.
    pub const fn order_key(&self) -> (Priority, u128, u64) {
        (self.priority, self.enqueued_at_ms, self.sequence)
    }
}

/// Final state reported to the bot records collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotTerminalStatus {
    /// Bot finished normally.
    Completed,
    /// Bot failed (missed heartbeats, stuck deploy, deploy error).
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot::new("local-slot-1", BackendKind::Local, InstanceRef::new("i-1"), 10)
    }

    #[test]
    fn test_patch_clears_bot_outside_active_states() {
        let mut s = slot();
        SlotPatch::deploying("bot-1").apply(&mut s, 20);
        assert_eq!(s.assigned_bot.as_deref(), Some("bot-1"));
        assert_eq!(s.status_changed_at_ms, 20);

        SlotPatch::error("boom").apply(&mut s, 30);
        assert_eq!(s.status, SlotStatus::Error);
        assert!(s.assigned_bot.is_none());
        assert_eq!(s.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_filter_matches() {
        let mut s = slot();
        SlotPatch::deploying("bot-1").apply(&mut s, 20);
        assert!(SlotFilter::bot("bot-1").matches(&s));
        assert!(!SlotFilter::bot("bot-2").matches(&s));
        assert!(SlotFilter::status(SlotStatus::Deploying).on(BackendKind::Local).matches(&s));
        assert!(!SlotFilter::all().on(BackendKind::Paas).matches(&s));
    }

    #[test]
    fn test_request_validation() {
        assert!(DeploymentRequest::new("bot-1").validate().is_ok());
        assert!(DeploymentRequest::new(" ").validate().is_err());
        assert!(DeploymentRequest::new("bot 1").validate().is_err());
        assert!(DeploymentRequest::new("bot-1").with_image("").validate().is_err());
    }

    #[test]
    fn test_entry_expiry_inclusive() {
        let entry = QueueEntry::new(DeploymentRequest::new("b"), BackendKind::Local, 0, 100);
        assert!(!entry.is_expired(99));
        assert!(entry.is_expired(100));
    }
}
