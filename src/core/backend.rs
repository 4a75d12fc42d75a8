//! Uniform contract over the execution backends bots are deployed onto.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::model::{DeploymentRequest, InstanceRef};
use crate::core::SchedulerError;
use crate::util::serde::{BackendKind, BotId};

/// Image used when a request names none.
pub const DEFAULT_BOT_IMAGE: &str = "meeting-bot:latest";

/// What a backend reports about one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Being created.
    Provisioning,
    /// Up.
    Running,
    /// Exists but not running.
    Stopped,
    /// Gone or going away; will not come back.
    Terminated,
    /// The backend has no such instance.
    NotFound,
}

impl InstanceStatus {
    /// The instance must be recreated before the slot can be used again.
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::Terminated | Self::NotFound)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// Everything a backend needs to start (or pre-create) an instance for a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployConfig {
    /// Slot the instance belongs to.
    pub slot_name: String,
    /// Instance already backing the slot, if any.
    pub instance: Option<InstanceRef>,
    /// Bot to run. `None` pre-creates an idle instance.
    pub bot_id: Option<BotId>,
    /// Container image.
    pub image: String,
    /// Command override.
    pub command: Option<String>,
    /// Command arguments.
    pub args: Vec<String>,
    /// Environment.
    pub env: BTreeMap<String, String>,
}

impl DeployConfig {
    /// Config for an idle instance backing `slot_name`.
    pub fn empty(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            image: DEFAULT_BOT_IMAGE.to_owned(),
            ..Self::default()
        }
    }

    /// Config running `request` on the slot's instance.
    pub fn for_request(slot_name: &str, instance: &InstanceRef, request: &DeploymentRequest) -> Self {
        Self {
            slot_name: slot_name.to_owned(),
            instance: Some(instance.clone()).filter(|i| !i.as_str().is_empty()),
            bot_id: Some(request.bot_id.clone()),
            image: request
                .image
                .clone()
                .unwrap_or_else(|| DEFAULT_BOT_IMAGE.to_owned()),
            command: request.command.clone(),
            args: request.args.clone(),
            env: request.env.clone(),
        }
    }

    /// Creation key: retries of the same deploy map to the same instance.
    pub fn idempotency_key(&self) -> String {
        match &self.bot_id {
            Some(bot) => format!("{}-{bot}", self.slot_name),
            None => self.slot_name.clone(),
        }
    }
}

/// One concrete execution backend.
///
/// `delete` treats a missing instance as success and `stop` never fails on an
/// already stopped instance, so callers may retry both freely.
#[async_trait]
pub trait PlatformBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Make `image` available locally. Backends that pull on deploy keep the
    /// default.
    async fn pull_image(&self, image: &str) -> Result<(), SchedulerError> {
        let _ = image;
        Ok(())
    }

    /// Start an instance. Safe to retry with the same config. When
    /// `config.instance` is set the bot runs on that instance and its
    /// reference is returned; no new instance is created.
    async fn deploy(&self, config: &DeployConfig) -> Result<InstanceRef, SchedulerError>;

    /// Best-effort graceful stop.
    async fn stop(&self, instance: &InstanceRef) -> Result<(), SchedulerError>;

    /// Remove an instance. Missing instances are not an error.
    async fn delete(&self, instance: &InstanceRef) -> Result<(), SchedulerError>;

    /// Current state of an instance.
    async fn describe(&self, instance: &InstanceRef) -> Result<InstanceStatus, SchedulerError>;

    /// Every instance this backend manages.
    async fn list_all(&self) -> Result<Vec<InstanceRef>, SchedulerError>;
}

/// Registered backends plus the order in which requests without an explicit
/// backend are routed.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn PlatformBackend>>,
    priority: Vec<BackendKind>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under its own kind, appending it to the priority
    /// order if not already present.
    pub fn register(&mut self, backend: Arc<dyn PlatformBackend>) {
        let kind = backend.kind();
        if !self.priority.contains(&kind) {
            self.priority.push(kind);
        }
        self.backends.insert(kind, backend);
    }

    /// Replace the routing order. Kinds without a registered backend are
    /// skipped when routing.
    pub fn set_priority(&mut self, order: Vec<BackendKind>) {
        self.priority = order;
    }

    /// Backend for `kind`.
    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn PlatformBackend>, SchedulerError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| SchedulerError::ConfigInvalid(format!("backend {kind} is not registered")))
    }

    /// Backend a request goes to: its explicit choice, or the first
    /// registered backend in priority order.
    pub fn resolve(&self, requested: Option<BackendKind>) -> Result<BackendKind, SchedulerError> {
        if let Some(kind) = requested {
            return self.get(kind).map(|_| kind);
        }
        self.kinds()
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::ConfigInvalid("no backend registered".into()))
    }

    /// Registered kinds in priority order.
    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self
            .priority
            .iter()
            .copied()
            .filter(|k| self.backends.contains_key(k))
            .collect();
        let mut rest: Vec<BackendKind> = self
            .backends
            .keys()
            .copied()
            .filter(|k| !kinds.contains(k))
            .collect();
        rest.sort_by_key(|k| k.as_str());
        kinds.extend(rest);
        kinds
    }

    /// Registered backends in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (BackendKind, Arc<dyn PlatformBackend>)> + '_ {
        self.kinds()
            .into_iter()
            .filter_map(|k| self.backends.get(&k).map(|b| (k, Arc::clone(b))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemoryBackend;

    #[test]
    fn test_idempotency_key() {
        let empty = DeployConfig::empty("local-slot-1");
        assert_eq!(empty.idempotency_key(), "local-slot-1");
        let request = DeploymentRequest::new("bot-7");
        let cfg = DeployConfig::for_request("local-slot-1", &InstanceRef::new("i-1"), &request);
        assert_eq!(cfg.idempotency_key(), "local-slot-1-bot-7");
        assert_eq!(cfg.image, DEFAULT_BOT_IMAGE);
    }

    #[test]
    fn test_resolve_follows_priority() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(InMemoryBackend::new(BackendKind::Local)));
        registry.register(Arc::new(InMemoryBackend::new(BackendKind::Paas)));
        assert_eq!(registry.resolve(None).unwrap(), BackendKind::Local);

        registry.set_priority(vec![BackendKind::Cluster, BackendKind::Paas]);
        assert_eq!(registry.resolve(None).unwrap(), BackendKind::Paas);
        assert_eq!(registry.kinds(), vec![BackendKind::Paas, BackendKind::Local]);
        assert!(registry.resolve(Some(BackendKind::Cluster)).is_err());
    }
}
