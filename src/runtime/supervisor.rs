//! Owns the scheduler's background loops.
//!
//! [`Supervisor::start`] spawns the dispatcher, the heartbeat sweep, the
//! recovery worker and the reconciliation worker on the current tokio
//! runtime. All four watch one shutdown channel; [`Supervisor::shutdown`]
//! flips it and waits for them. Dropping the supervisor closes the channel,
//! which stops the loops too.

use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::{AppResult, Scheduler};

/// Running background loops of one scheduler instance.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    /// Spawn every loop for `scheduler`. Fails outside a tokio runtime.
    pub fn start(scheduler: &Scheduler) -> AppResult<Self> {
        let handle = Handle::try_current().context("supervisor needs a tokio runtime")?;
        let (shutdown, rx) = watch::channel(false);

        let queue = scheduler.queue().clone();
        let dispatcher_rx = rx.clone();
        let dispatcher = handle.spawn(async move { queue.run_dispatcher(dispatcher_rx).await });

        let heartbeats = handle.spawn(Arc::clone(scheduler.heartbeats()).run(rx.clone()));
        let recovery = handle.spawn(Arc::clone(scheduler.recovery()).run(rx.clone()));
        let reconcile = handle.spawn(Arc::clone(scheduler.reconciler()).run(rx));

        tracing::info!("scheduler background loops started");
        Ok(Self {
            shutdown,
            tasks: vec![
                ("dispatcher", dispatcher),
                ("heartbeat", heartbeats),
                ("recovery", recovery),
                ("reconcile", reconcile),
            ],
        })
    }

    /// Whether every loop is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|(_, task)| !task.is_finished())
    }

    /// Signal shutdown and wait for every loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "background loop ended abnormally");
            }
        }
        tracing::info!("scheduler background loops stopped");
    }
}
