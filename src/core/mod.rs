//! Core scheduling abstractions: slot state machine, admission queue,
//! locks and background workers.

pub mod allocator;
pub mod audit;
pub mod backend;
pub mod deployer;
pub mod error;
pub mod heartbeat;
pub mod lock;
pub mod model;
pub mod pull_lock;
pub mod queue;
pub mod reconcile;
pub mod recovery;
pub mod scheduler;
pub mod store;

use futures::future::BoxFuture;

pub use allocator::{SlotAllocator, SlotLease};
pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, SharedAudit};
pub use backend::{BackendRegistry, DeployConfig, InstanceStatus, PlatformBackend};
pub use deployer::{Assignment, DeployRetry, Deployer};
pub use error::{AppResult, SchedulerError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatTiming};
pub use lock::{AdvisoryLock, LockGuard, LockTiming};
pub use model::{
    BotTerminalStatus, DeploymentRequest, InstanceRef, QueueEntry, Slot, SlotFilter, SlotPatch, SlotStatus,
};
pub use pull_lock::ImagePullLock;
pub use queue::{DeploymentOutcome, DeploymentQueue, DeploymentTicket, DispatchReport, QueueLimits, SubmitState};
pub use reconcile::{ReconcileReport, Reconciler};
pub use recovery::{RecoveryPolicy, RecoveryReport, RecoveryWorker};
pub use scheduler::Scheduler;
pub use store::{BotRegistry, LockStore, QueueStore, SlotStore};

/// Abstraction for spawning background work on a runtime.
pub trait Spawn: Send + Sync {
    /// Run `fut` to completion in the background.
    fn spawn(&self, fut: BoxFuture<'static, ()>);
}
