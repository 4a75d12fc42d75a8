//! Local process backend.
//!
//! Instances are named registrations in this process. Deploying a bot onto
//! one spawns the configured command with `BOT_ID` and `SLOT_NAME` set, so a
//! development machine can run the whole scheduler with no external service.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::core::backend::{DeployConfig, InstanceStatus, PlatformBackend};
use crate::core::model::InstanceRef;
use crate::core::SchedulerError;
use crate::util::serde::{BackendKind, BotId};

struct LocalInstance {
    bot_id: Option<BotId>,
    child: Option<Child>,
}

impl LocalInstance {
    async fn kill(&mut self) -> Result<(), SchedulerError> {
        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::InvalidInput => {}
                Err(e) => return Err(SchedulerError::Backend(format!("failed to kill process: {e}"))),
            }
        }
        self.bot_id = None;
        Ok(())
    }
}

/// Runs bots as child processes of the scheduler.
#[derive(Default)]
pub struct LocalProcessBackend {
    instances: Mutex<HashMap<String, LocalInstance>>,
    default_command: Option<(String, Vec<String>)>,
}

impl LocalProcessBackend {
    /// Backend that requires each request to name its command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Command used when a request names none.
    #[must_use]
    pub fn with_default_command(mut self, command: impl Into<String>, args: &[&str]) -> Self {
        self.default_command = Some((command.into(), args.iter().map(|a| (*a).to_owned()).collect()));
        self
    }

    /// OS process id of the bot running on `instance`.
    pub async fn pid(&self, instance: &InstanceRef) -> Option<u32> {
        self.instances
            .lock()
            .await
            .get(instance.as_str())
            .and_then(|i| i.child.as_ref())
            .and_then(Child::id)
    }

    fn spawn(&self, config: &DeployConfig, bot_id: &str) -> Result<Child, SchedulerError> {
        let (program, args) = match (&config.command, &self.default_command) {
            (Some(command), _) => (command.clone(), config.args.clone()),
            (None, Some((command, args))) => (command.clone(), args.clone()),
            (None, None) => {
                return Err(SchedulerError::ConfigInvalid(format!(
                    "bot {bot_id}: no command configured for the local backend"
                )))
            }
        };

        tracing::info!(bot_id, slot = %config.slot_name, command = %program, "spawning local bot process");
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&config.env)
            .env("BOT_ID", bot_id)
            .env("SLOT_NAME", &config.slot_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                SchedulerError::ConfigInvalid(format!("cannot run `{program}`: {e}"))
            }
            _ => SchedulerError::BackendUnavailable(format!("failed to spawn `{program}`: {e}")),
        })
    }
}

#[async_trait]
impl PlatformBackend for LocalProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn deploy(&self, config: &DeployConfig) -> Result<InstanceRef, SchedulerError> {
        let id = config
            .instance
            .as_ref()
            .map_or_else(|| format!("local-{}", config.slot_name), |i| i.as_str().to_owned());

        let mut instances = self.instances.lock().await;
        let entry = instances.entry(id.clone()).or_insert_with(|| LocalInstance {
            bot_id: None,
            child: None,
        });

        let Some(bot_id) = config.bot_id.as_deref() else {
            return Ok(InstanceRef::new(id));
        };
        if entry.bot_id.as_deref() == Some(bot_id) && entry.child.is_some() {
            return Ok(InstanceRef::new(id));
        }

        entry.kill().await?;
        entry.child = Some(self.spawn(config, bot_id)?);
        entry.bot_id = Some(bot_id.to_owned());
        Ok(InstanceRef::new(id))
    }

    async fn stop(&self, instance: &InstanceRef) -> Result<(), SchedulerError> {
        if let Some(entry) = self.instances.lock().await.get_mut(instance.as_str()) {
            entry.kill().await?;
        }
        Ok(())
    }

    async fn delete(&self, instance: &InstanceRef) -> Result<(), SchedulerError> {
        let removed = self.instances.lock().await.remove(instance.as_str());
        if let Some(mut entry) = removed {
            entry.kill().await?;
        }
        Ok(())
    }

    async fn describe(&self, instance: &InstanceRef) -> Result<InstanceStatus, SchedulerError> {
        let mut instances = self.instances.lock().await;
        let Some(entry) = instances.get_mut(instance.as_str()) else {
            return Ok(InstanceStatus::NotFound);
        };
        let Some(child) = entry.child.as_mut() else {
            return Ok(InstanceStatus::Stopped);
        };
        match child.try_wait() {
            Ok(None) => Ok(InstanceStatus::Running),
            Ok(Some(status)) => {
                tracing::debug!(instance = %instance, ?status, "local bot process exited");
                entry.child = None;
                entry.bot_id = None;
                Ok(InstanceStatus::Stopped)
            }
            Err(e) => Err(SchedulerError::Backend(format!("failed to check process: {e}"))),
        }
    }

    async fn list_all(&self) -> Result<Vec<InstanceRef>, SchedulerError> {
        let mut ids: Vec<InstanceRef> = self
            .instances
            .lock()
            .await
            .keys()
            .map(|id| InstanceRef::new(id.as_str()))
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}
