//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
///
/// The type is `Clone` so a single failure (for example a failed image pull)
/// can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The backend could not be reached or answered with a server error.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// The backend refused to create more instances.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// No idle slot exists for the requested backend.
    #[error("no idle slot available on {0}")]
    NoneAvailable(String),
    /// The request waited in the queue past its deadline.
    #[error("queue timeout for bot {0}")]
    QueueTimeout(String),
    /// An advisory lock could not be acquired in time.
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    /// A held lease expired and another owner took the key.
    #[error("lock lease lost: {0}")]
    LockLost(String),
    /// The request or configuration is invalid and must not be retried.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// A slot exceeded its recovery attempts and needs an operator.
    #[error("recovery exhausted for slot {0}")]
    RecoveryExhausted(String),
    /// The referenced record or instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A slot was not in a state that allows the requested transition.
    #[error("invalid slot transition: {0}")]
    InvalidTransition(String),
    /// The bot already holds a slot.
    #[error("bot {0} already holds a slot")]
    AlreadyAssigned(String),
    /// The bot already has an outstanding request.
    #[error("duplicate request for bot {0}")]
    DuplicateRequest(String),
    /// The request was withdrawn before admission.
    #[error("request cancelled for bot {0}")]
    Cancelled(String),
    /// Persistence failure in a slot, queue or lock store.
    #[error("store error: {0}")]
    Store(String),
    /// Backend-specific failure that fits no other category.
    #[error("backend error: {0}")]
    Backend(String),
}

impl SchedulerError {
    /// Contention or outage that is worth retrying with backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::LockTimeout(_))
    }

    /// Capacity exhaustion that should route the request to the queue.
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::NoneAvailable(_) | Self::QuotaExceeded(_))
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
