//! Runs one admitted request on its claimed slot.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::core::allocator::SlotLease;
use crate::core::backend::{BackendRegistry, DeployConfig, PlatformBackend};
use crate::core::heartbeat::HeartbeatMonitor;
use crate::core::model::{DeploymentRequest, InstanceRef};
use crate::core::pull_lock::ImagePullLock;
use crate::core::SchedulerError;
use crate::util::backoff::ExponentialBackoff;
use crate::util::clock::now_ms;
use crate::util::serde::{BackendKind, BotId, SlotId};

/// Local retry of transient backend failures.
#[derive(Debug, Clone, Copy)]
pub struct DeployRetry {
    /// Total tries, first one included.
    pub attempts: u32,
    /// Wait between tries.
    pub backoff: ExponentialBackoff,
}

impl Default for DeployRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: ExponentialBackoff::new(
                std::time::Duration::from_millis(200),
                std::time::Duration::from_secs(5),
            ),
        }
    }
}

/// Where a bot ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Bot.
    pub bot_id: BotId,
    /// Slot it runs on.
    pub slot_id: SlotId,
    /// Slot name.
    pub slot_name: String,
    /// Backend.
    pub backend: BackendKind,
    /// Backend instance running the bot.
    pub instance: InstanceRef,
}

/// Pull, deploy, confirm. On any failure the slot is settled before the
/// error is returned.
#[derive(Clone)]
pub struct Deployer {
    backends: BackendRegistry,
    pull_lock: ImagePullLock,
    heartbeats: Arc<HeartbeatMonitor>,
    retry: DeployRetry,
}

impl Deployer {
    /// Deployer over `backends`.
    pub const fn new(
        backends: BackendRegistry,
        pull_lock: ImagePullLock,
        heartbeats: Arc<HeartbeatMonitor>,
        retry: DeployRetry,
    ) -> Self {
        Self {
            backends,
            pull_lock,
            heartbeats,
            retry,
        }
    }

    /// Deploy `request` onto the slot held by `lease`.
    pub async fn deploy(&self, request: &DeploymentRequest, mut lease: SlotLease) -> Result<Assignment, SchedulerError> {
        let bot_id = request.bot_id.as_str();
        let backend = match self.backends.get(lease.slot().backend) {
            Ok(backend) => backend,
            Err(e) => {
                Self::release_quietly(lease).await;
                return Err(e);
            }
        };

        let outcome = AssertUnwindSafe(self.run(&backend, request, &mut lease))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                let slot = lease.into_assignment();
                self.heartbeats.track(bot_id, now_ms());
                tracing::info!(bot_id, slot = %slot.name, instance = %slot.instance, "bot deployed");
                Ok(Assignment {
                    bot_id: request.bot_id.clone(),
                    slot_id: slot.id,
                    slot_name: slot.name,
                    backend: slot.backend,
                    instance: slot.instance,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(bot_id, slot = %lease.slot().name, error = %e, "deploy failed");
                Self::settle_failure(backend.as_ref(), lease, &e).await;
                Err(e)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!(bot_id, slot = %lease.slot().name, panic = %message, "deploy panicked");
                Self::release_quietly(lease).await;
                Err(SchedulerError::Backend(format!("deploy panicked: {message}")))
            }
        }
    }

    async fn run(
        &self,
        backend: &Arc<dyn PlatformBackend>,
        request: &DeploymentRequest,
        lease: &mut SlotLease,
    ) -> Result<(), SchedulerError> {
        let slot = lease.slot();
        let config = DeployConfig::for_request(&slot.name, &slot.instance, request);
        let kind = backend.kind();

        self.with_retry("pull", &request.bot_id, || {
            let backend = Arc::clone(backend);
            let image = config.image.clone();
            self.pull_lock
                .run(kind, &config.image, move || async move { backend.pull_image(&image).await })
        })
        .await?;

        let instance = self
            .with_retry("deploy", &request.bot_id, || backend.deploy(&config))
            .await?;
        lease.set_instance(instance).await?;
        lease.mark_busy().await
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, bot_id: &str, mut op: F) -> Result<T, SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SchedulerError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.backoff.delay(attempt);
                    tracing::warn!(bot_id, what, attempt, ?delay, error = %e, "transient backend failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Idle again if the instance is still there, error (for recovery) if it
    /// is gone.
    async fn settle_failure(backend: &dyn PlatformBackend, lease: SlotLease, err: &SchedulerError) {
        let instance = lease.slot().instance.clone();
        match lease.is_held().await {
            Ok(true) => {}
            Ok(false) => {
                // Recovery took the slot back; it may already serve another bot.
                tracing::warn!(bot_id = lease.bot_id(), slot = %lease.slot().name, "slot no longer held; leaving it alone");
                lease.abandon();
                return;
            }
            Err(e) => tracing::warn!(slot = %lease.slot().name, error = %e, "cannot check slot ownership after deploy failure"),
        }
        let status = backend.describe(&instance).await;
        let settled = match status {
            Ok(status) if status.is_gone() => {
                lease
                    .fail(&format!("deploy failed ({err}); instance {instance} is {status}"))
                    .await
            }
            Ok(_) => {
                if let Err(e) = backend.stop(&instance).await {
                    tracing::warn!(instance = %instance, error = %e, "failed to stop instance after deploy failure");
                }
                lease.release().await
            }
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "cannot describe instance after deploy failure");
                lease.release().await
            }
        };
        if let Err(e) = settled {
            tracing::error!(instance = %instance, error = %e, "failed to settle slot after deploy failure");
        }
    }

    async fn release_quietly(lease: SlotLease) {
        let name = lease.slot().name.clone();
        if let Err(e) = lease.release().await {
            tracing::error!(slot = %name, error = %e, "failed to release slot");
        }
    }
}
