//! Admission control for deployment requests.
//!
//! A request is admitted when the global and per-backend in-flight caps both
//! have room and the allocator hands out a slot. Otherwise it waits as a
//! [`QueueEntry`] until the dispatcher admits it, it times out, or it is
//! cancelled. Within a backend admission is strictly priority, then enqueue
//! time, then sequence; a new request never overtakes entries already
//! waiting for its backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};

use crate::core::allocator::SlotAllocator;
use crate::core::audit::{self, AuditAction, SharedAudit};
use crate::core::backend::BackendRegistry;
use crate::core::deployer::{Assignment, Deployer};
use crate::core::model::{DeploymentRequest, QueueEntry};
use crate::core::{QueueStore, SchedulerError, Spawn};
use crate::util::clock::{add_ms, now_ms};
use crate::util::serde::{BackendKind, BotId};

/// Caps and timeouts for admission.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    /// In-flight deployments across all backends.
    pub max_concurrent: u32,
    /// In-flight deployments per backend. Missing backends are uncapped.
    pub per_backend: HashMap<BackendKind, u32>,
    /// How long a request may wait.
    pub timeout: Duration,
    /// Per-backend override of `timeout`.
    pub backend_timeouts: HashMap<BackendKind, Duration>,
    /// Dispatcher wake-up when nothing signals it.
    pub poll_interval: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            per_backend: HashMap::new(),
            timeout: Duration::from_secs(300),
            backend_timeouts: HashMap::new(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl QueueLimits {
    /// How long a request for `backend` may wait.
    pub fn timeout_for(&self, backend: BackendKind) -> Duration {
        self.backend_timeouts.get(&backend).copied().unwrap_or(self.timeout)
    }

    fn backend_cap(&self, backend: BackendKind) -> u32 {
        self.per_backend.get(&backend).copied().unwrap_or(u32::MAX)
    }
}

/// How a request finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeploymentOutcome {
    /// Deployed by this scheduler.
    Deployed(Assignment),
    /// Left the queue through another scheduler instance sharing the store.
    AdmittedElsewhere,
}

/// Where a request stood right after submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitState {
    /// A slot was claimed and the deploy is running.
    Admitted,
    /// Waiting in the queue.
    Queued,
}

/// Handle to a submitted request.
#[derive(Debug)]
pub struct DeploymentTicket {
    bot_id: BotId,
    state: SubmitState,
    rx: oneshot::Receiver<Result<DeploymentOutcome, SchedulerError>>,
}

impl DeploymentTicket {
    /// Bot the ticket is for.
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// State at submission.
    pub const fn state(&self) -> SubmitState {
        self.state
    }

    /// Wait for the deploy to finish, the entry to time out, or a cancel.
    pub async fn wait(self) -> Result<DeploymentOutcome, SchedulerError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(SchedulerError::Cancelled(self.bot_id)))
    }
}

/// What one dispatcher sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Entries admitted.
    pub admitted: usize,
    /// Entries dropped for timing out.
    pub expired: usize,
    /// Entries left waiting.
    pub waiting: usize,
}

/// Which cap stopped an admission.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Blocked {
    Global,
    Backend,
    Slots(SchedulerError),
    /// The entry left the queue (cancelled, or taken by another instance)
    /// while its slot was being claimed.
    Withdrawn,
}

struct Waiter {
    tx: oneshot::Sender<Result<DeploymentOutcome, SchedulerError>>,
    queued_until: Option<u128>,
}

struct QueueInner {
    store: Arc<dyn QueueStore>,
    allocator: SlotAllocator,
    backends: BackendRegistry,
    deployer: Deployer,
    spawner: Arc<dyn Spawn>,
    limits: QueueLimits,
    active: AtomicU32,
    active_by_backend: Mutex<HashMap<BackendKind, u32>>,
    waiters: Mutex<HashMap<BotId, Waiter>>,
    wake: Notify,
    sweep: tokio::sync::Mutex<()>,
    audit: Option<SharedAudit>,
}

/// One in-flight deployment counted against the caps.
struct InFlightPermit {
    inner: Arc<QueueInner>,
    backend: BackendKind,
    launched: bool,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(count) = self.inner.active_by_backend.lock().get_mut(&self.backend) {
            *count = count.saturating_sub(1);
        }
        if self.launched {
            self.inner.wake.notify_one();
        }
    }
}

impl QueueInner {
    /// Reserve one unit of global capacity with a CAS loop.
    fn try_reserve_global(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limits.max_concurrent {
                return false;
            }
            match self.active.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn reserve(self: &Arc<Self>, backend: BackendKind) -> Result<InFlightPermit, Blocked> {
        if !self.try_reserve_global() {
            return Err(Blocked::Global);
        }
        {
            let mut by_backend = self.active_by_backend.lock();
            let count = by_backend.entry(backend).or_insert(0);
            if *count >= self.limits.backend_cap(backend) {
                drop(by_backend);
                self.active.fetch_sub(1, Ordering::AcqRel);
                return Err(Blocked::Backend);
            }
            *count += 1;
        }
        Ok(InFlightPermit {
            inner: Arc::clone(self),
            backend,
            launched: false,
        })
    }

    fn resolve(&self, bot_id: &str, outcome: Result<DeploymentOutcome, SchedulerError>) {
        let waiter = self.waiters.lock().remove(bot_id);
        if let Some(waiter) = waiter {
            if waiter.tx.send(outcome).is_err() {
                tracing::debug!(bot_id, "caller stopped waiting for deployment outcome");
            }
        }
    }

    fn mark_launched(&self, bot_id: &str) {
        if let Some(waiter) = self.waiters.lock().get_mut(bot_id) {
            waiter.queued_until = None;
        }
    }
}

/// Deployment queue plus dispatcher.
#[derive(Clone)]
pub struct DeploymentQueue {
    inner: Arc<QueueInner>,
}

impl DeploymentQueue {
    /// Queue admitting through `allocator` and deploying through `deployer`.
    pub fn new(
        store: Arc<dyn QueueStore>,
        allocator: SlotAllocator,
        backends: BackendRegistry,
        deployer: Deployer,
        spawner: Arc<dyn Spawn>,
        limits: QueueLimits,
        audit: Option<SharedAudit>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                allocator,
                backends,
                deployer,
                spawner,
                limits,
                active: AtomicU32::new(0),
                active_by_backend: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                sweep: tokio::sync::Mutex::new(()),
                audit,
            }),
        }
    }

    /// Caps in use.
    pub fn limits(&self) -> &QueueLimits {
        &self.inner.limits
    }

    /// Deployments in flight.
    pub fn in_flight(&self) -> u32 {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Deployments in flight on `backend`.
    pub fn in_flight_on(&self, backend: BackendKind) -> u32 {
        self.inner
            .active_by_backend
            .lock()
            .get(&backend)
            .copied()
            .unwrap_or(0)
    }

    /// Waiting entries in dispatch order.
    pub async fn entries(&self, backend: Option<BackendKind>) -> Result<Vec<QueueEntry>, SchedulerError> {
        self.inner.store.list(backend).await
    }

    /// Submit a request: admit it now or queue it.
    pub async fn submit(&self, request: DeploymentRequest) -> Result<DeploymentTicket, SchedulerError> {
        request.validate()?;
        let backend = self.inner.backends.resolve(request.backend)?;
        let bot_id = request.bot_id.clone();

        if self.inner.store.contains(&bot_id).await? {
            return Err(SchedulerError::DuplicateRequest(bot_id));
        }
        if self.inner.allocator.find_by_bot(&bot_id).await?.is_some() {
            return Err(SchedulerError::AlreadyAssigned(bot_id));
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.inner.waiters.lock();
            if waiters.contains_key(&bot_id) {
                return Err(SchedulerError::DuplicateRequest(bot_id));
            }
            waiters.insert(bot_id.clone(), Waiter { tx, queued_until: None });
        }

        match self.admit_or_enqueue(backend, request).await {
            Ok(state) => Ok(DeploymentTicket { bot_id, state, rx }),
            Err(e) => {
                self.inner.waiters.lock().remove(&bot_id);
                Err(e)
            }
        }
    }

    async fn admit_or_enqueue(&self, backend: BackendKind, request: DeploymentRequest) -> Result<SubmitState, SchedulerError> {
        let bot_id = request.bot_id.clone();
        if self.inner.store.list(Some(backend)).await?.is_empty() {
            match self.admit(backend, &request, false).await? {
                Ok(()) => {
                    audit::record(self.inner.audit.as_ref(), bot_id.as_str(), backend, Some(&bot_id), AuditAction::Admit, Some("direct".into()));
                    return Ok(SubmitState::Admitted);
                }
                Err(blocked) => tracing::debug!(bot_id = %bot_id, %backend, reason = ?blocked, "no immediate capacity"),
            }
        }

        let now = now_ms();
        let timeout_at = add_ms(now, self.inner.limits.timeout_for(backend));
        let entry = self
            .inner
            .store
            .push(QueueEntry::new(request, backend, now, timeout_at))
            .await?;
        if let Some(waiter) = self.inner.waiters.lock().get_mut(&bot_id) {
            waiter.queued_until = Some(entry.timeout_at_ms);
        }
        tracing::info!(bot_id = %bot_id, %backend, priority = %entry.priority, "deployment request queued");
        audit::record(
            self.inner.audit.as_ref(),
            bot_id.as_str(),
            backend,
            Some(&bot_id),
            AuditAction::Enqueue,
            Some(entry.request.summary()),
        );
        self.inner.wake.notify_one();
        Ok(SubmitState::Queued)
    }

    /// Reserve capacity, claim a slot and start the deploy in the background.
    /// The outer error is fatal for the request; the inner one says which
    /// limit held it back.
    ///
    /// A `queued` request keeps its entry until the slot is claimed and only
    /// then takes it off the queue, so a cancel or another instance racing
    /// the claim always finds either the entry or the launched deploy.
    async fn admit(
        &self,
        backend: BackendKind,
        request: &DeploymentRequest,
        queued: bool,
    ) -> Result<Result<(), Blocked>, SchedulerError> {
        let mut permit = match self.inner.reserve(backend) {
            Ok(permit) => permit,
            Err(blocked) => return Ok(Err(blocked)),
        };
        let lease = match self.inner.allocator.claim(backend, &request.bot_id).await {
            Ok(lease) => lease,
            Err(e) if e.is_capacity() || e.is_transient() => return Ok(Err(Blocked::Slots(e))),
            // Another instance admitted this entry first.
            Err(SchedulerError::AlreadyAssigned(_)) if queued => return Ok(Err(Blocked::Withdrawn)),
            Err(e) => return Err(e),
        };
        if queued && self.inner.store.remove(&request.bot_id).await?.is_none() {
            tracing::info!(bot_id = %request.bot_id, %backend, "entry withdrawn during claim; returning slot");
            lease.release().await?;
            return Ok(Err(Blocked::Withdrawn));
        }

        permit.launched = true;
        self.inner.mark_launched(&request.bot_id);
        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        self.inner.spawner.spawn(Box::pin(async move {
            let result = inner
                .deployer
                .deploy(&request, lease)
                .await
                .map(DeploymentOutcome::Deployed);
            drop(permit);
            inner.resolve(&request.bot_id, result);
        }));
        Ok(Ok(()))
    }

    /// Withdraw a queued request. Returns whether an entry was removed.
    pub async fn cancel(&self, bot_id: &str) -> Result<bool, SchedulerError> {
        let Some(entry) = self.inner.store.remove(bot_id).await? else {
            return Ok(false);
        };
        tracing::info!(bot_id, backend = %entry.backend, "queued request cancelled");
        audit::record(self.inner.audit.as_ref(), bot_id, entry.backend, Some(bot_id), AuditAction::Cancel, None);
        self.inner
            .resolve(bot_id, Err(SchedulerError::Cancelled(bot_id.to_owned())));
        self.inner.wake.notify_one();
        Ok(true)
    }

    /// One dispatcher pass: expire overdue entries, then admit in order
    /// until the global cap is reached. A backend that cannot take its head
    /// entry is skipped for the rest of the pass so nothing behind it jumps
    /// the line.
    pub async fn dispatch_once(&self, now_ms: u128) -> Result<DispatchReport, SchedulerError> {
        let _sweep = self.inner.sweep.lock().await;
        let mut report = DispatchReport::default();
        let entries = self.inner.store.list(None).await?;

        let (expired, live): (Vec<QueueEntry>, Vec<QueueEntry>) =
            entries.into_iter().partition(|e| e.is_expired(now_ms));
        for entry in expired {
            if self.inner.store.remove(&entry.bot_id).await?.is_none() {
                continue;
            }
            report.expired += 1;
            tracing::warn!(bot_id = %entry.bot_id, backend = %entry.backend, "queued request timed out");
            audit::record(self.inner.audit.as_ref(), entry.bot_id.as_str(), entry.backend, Some(&entry.bot_id), AuditAction::Expire, None);
            self.inner
                .resolve(&entry.bot_id, Err(SchedulerError::QueueTimeout(entry.bot_id.clone())));
        }

        let mut blocked: HashSet<BackendKind> = HashSet::new();
        for entry in live {
            if blocked.contains(&entry.backend) {
                continue;
            }
            match self.admit(entry.backend, &entry.request, true).await {
                Ok(Ok(())) => {
                    report.admitted += 1;
                    tracing::info!(bot_id = %entry.bot_id, backend = %entry.backend, priority = %entry.priority, "queued request admitted");
                    audit::record(self.inner.audit.as_ref(), entry.bot_id.as_str(), entry.backend, Some(&entry.bot_id), AuditAction::Admit, None);
                }
                Ok(Err(Blocked::Withdrawn)) => {}
                Ok(Err(Blocked::Global)) => break,
                Ok(Err(_)) => {
                    blocked.insert(entry.backend);
                }
                Err(e) => {
                    tracing::error!(bot_id = %entry.bot_id, error = %e, "queued request cannot be admitted");
                    if self.inner.store.remove(&entry.bot_id).await?.is_some() {
                        self.inner.resolve(&entry.bot_id, Err(e));
                    }
                }
            }
        }

        report.waiting = self.inner.store.len().await?;
        self.resolve_vanished(now_ms).await?;
        Ok(report)
    }

    /// Settle local callers whose entries another instance took off the
    /// queue.
    async fn resolve_vanished(&self, now_ms: u128) -> Result<(), SchedulerError> {
        let queued: Vec<(BotId, u128)> = self
            .inner
            .waiters
            .lock()
            .iter()
            .filter_map(|(bot, w)| w.queued_until.map(|until| (bot.clone(), until)))
            .collect();
        if queued.is_empty() {
            return Ok(());
        }
        let present: HashSet<BotId> = self
            .inner
            .store
            .list(None)
            .await?
            .into_iter()
            .map(|e| e.bot_id)
            .collect();
        for (bot_id, until) in queued {
            if present.contains(&bot_id) {
                continue;
            }
            let outcome = if now_ms >= until {
                Err(SchedulerError::QueueTimeout(bot_id.clone()))
            } else {
                Ok(DeploymentOutcome::AdmittedElsewhere)
            };
            tracing::debug!(bot_id = %bot_id, "queue entry handled by another instance");
            self.inner.resolve(&bot_id, outcome);
        }
        Ok(())
    }

    /// Dispatch whenever capacity may have changed, or every poll interval,
    /// until `shutdown` flips or its sender goes away.
    pub async fn run_dispatcher(&self, mut shutdown: watch::Receiver<bool>) {
        let capacity = self.inner.allocator.capacity_signal();
        let poll = self.inner.limits.poll_interval;
        tracing::info!(?poll, "dispatcher started");
        while !*shutdown.borrow() {
            match self.dispatch_once(now_ms()).await {
                Ok(report) if report.admitted > 0 || report.expired > 0 => {
                    tracing::debug!(admitted = report.admitted, expired = report.expired, waiting = report.waiting, "dispatch sweep");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "dispatch sweep failed"),
            }
            tokio::select! {
                () = self.inner.wake.notified() => {}
                () = capacity.notified() => {}
                () = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("dispatcher stopped");
    }
}
