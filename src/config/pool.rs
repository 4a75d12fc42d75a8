//! Slot pool and scheduler configuration structures.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{AppResult, DeployRetry, HeartbeatTiming, LockTiming, QueueLimits, RecoveryPolicy};
use crate::util::backoff::ExponentialBackoff;
use crate::util::serde::BackendKind;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "BOTPOOL_CONFIG";

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "BOTPOOL_";

/// Queue store selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueBackendConfig {
    /// In-memory queue for development/testing.
    #[default]
    InMemory,
    /// JSON-lines file queue that survives restarts.
    File {
        /// Directory holding the queue file.
        path: PathBuf,
        /// File stem inside `path`.
        #[serde(default = "default_stream")]
        stream: String,
    },
}

/// Advisory lock store selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockBackendConfig {
    /// Lease table shared by handles in one process.
    #[default]
    InMemory,
    /// Lock files in a directory shared by every scheduler process.
    File {
        /// Lock directory.
        dir: PathBuf,
    },
}

/// Per-backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Disabled backends are not registered and never receive requests.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cap on in-flight deployments on this backend. Unlimited when absent.
    #[serde(default)]
    pub max_concurrent_slots: Option<u32>,
    /// Queue timeout override in seconds.
    #[serde(default)]
    pub queue_timeout_secs: Option<u64>,
    /// Service API base URL (PaaS).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API token (PaaS).
    #[serde(default)]
    pub token_env: Option<String>,
    /// Request timeout in seconds (PaaS).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bot command (local process).
    #[serde(default)]
    pub command: Option<String>,
    /// Bot command arguments (local process).
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_slots: None,
            queue_timeout_secs: None,
            endpoint: None,
            token_env: None,
            request_timeout_secs: default_request_timeout_secs(),
            command: None,
            args: Vec::new(),
        }
    }
}

impl BackendConfig {
    /// Validate backend configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_slots == Some(0) {
            return Err("max_concurrent_slots must be greater than 0".into());
        }
        if self.queue_timeout_secs == Some(0) {
            return Err("queue_timeout_secs must be greater than 0".into());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".into());
        }
        if self.endpoint.as_deref().is_some_and(|e| e.trim().is_empty()) {
            return Err("endpoint must not be empty".into());
        }
        Ok(())
    }
}

/// Heartbeat cadence in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Expected reporting interval.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    /// Silence after which a bot is failed.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub timeout_secs: u64,
    /// Sweep cadence; twice the interval when absent.
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_secs: default_heartbeat_timeout_secs(),
            sweep_interval_secs: None,
        }
    }
}

/// Recovery worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Pause between passes.
    #[serde(default = "default_recovery_interval_secs")]
    pub interval_secs: u64,
    /// Deploying longer than this is stuck.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    /// Failed attempts allowed before a slot is left for an operator.
    #[serde(default = "default_recovery_max_attempts")]
    pub max_attempts: u32,
    /// First backoff step.
    #[serde(default = "default_recovery_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Backoff cap.
    #[serde(default = "default_recovery_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recovery_interval_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            max_attempts: default_recovery_max_attempts(),
            backoff_base_secs: default_recovery_backoff_base_secs(),
            backoff_max_secs: default_recovery_backoff_max_secs(),
        }
    }
}

/// Local retry of transient deploy failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRetryConfig {
    /// Total tries, first included.
    #[serde(default = "default_deploy_attempts")]
    pub attempts: u32,
    /// First backoff step in milliseconds.
    #[serde(default = "default_deploy_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_deploy_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for DeployRetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_deploy_attempts(),
            backoff_base_ms: default_deploy_backoff_base_ms(),
            backoff_max_ms: default_deploy_backoff_max_ms(),
        }
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on in-flight deployments.
    #[serde(default = "default_max_concurrent_deployments")]
    pub max_concurrent_deployments: u32,
    /// How long a request may wait in the queue.
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    /// Routing order for requests without an explicit backend.
    #[serde(default = "default_backend_priority")]
    pub backend_priority: Vec<BackendKind>,
    /// Per-backend settings, keyed by backend name.
    #[serde(default)]
    pub backends: HashMap<BackendKind, BackendConfig>,
    /// Heartbeat cadence.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Recovery worker.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Deploy retry.
    #[serde(default)]
    pub deploy_retry: DeployRetryConfig,
    /// Pause between reconciliation passes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Deduplicate concurrent pulls of one image.
    #[serde(default = "default_true")]
    pub image_pull_lock_enabled: bool,
    /// Longest wait for an advisory lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Lease length of an advisory lock.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    /// Dispatcher poll when nothing wakes it.
    #[serde(default = "default_dispatch_poll_ms")]
    pub dispatch_poll_ms: u64,
    /// Queue store.
    #[serde(default)]
    pub queue: QueueBackendConfig,
    /// Advisory lock store.
    #[serde(default)]
    pub lock: LockBackendConfig,
    /// Events kept by the in-memory audit sink.
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deployments: default_max_concurrent_deployments(),
            queue_timeout_secs: default_queue_timeout_secs(),
            backend_priority: default_backend_priority(),
            backends: HashMap::new(),
            heartbeat: HeartbeatConfig::default(),
            recovery: RecoveryConfig::default(),
            deploy_retry: DeployRetryConfig::default(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            image_pull_lock_enabled: true,
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_lease_secs: default_lock_lease_secs(),
            dispatch_poll_ms: default_dispatch_poll_ms(),
            queue: QueueBackendConfig::default(),
            lock: LockBackendConfig::default(),
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_deployments == 0 {
            return Err("max_concurrent_deployments must be greater than 0".into());
        }
        if self.queue_timeout_secs == 0 {
            return Err("queue_timeout_secs must be greater than 0".into());
        }
        if self.backend_priority.is_empty() {
            return Err("backend_priority must name at least one backend".into());
        }
        let mut seen = HashSet::new();
        for kind in &self.backend_priority {
            if !seen.insert(kind) {
                return Err(format!("backend `{kind}` listed twice in backend_priority"));
            }
        }
        for (kind, backend) in &self.backends {
            backend
                .validate()
                .map_err(|e| format!("backend `{kind}` invalid: {e}"))?;
        }

        let hb = &self.heartbeat;
        if hb.interval_secs == 0 {
            return Err("heartbeat.interval_secs must be greater than 0".into());
        }
        if hb.timeout_secs < hb.interval_secs {
            return Err("heartbeat.timeout_secs must be at least heartbeat.interval_secs".into());
        }
        if hb.sweep_interval_secs == Some(0) {
            return Err("heartbeat.sweep_interval_secs must be greater than 0".into());
        }

        let rec = &self.recovery;
        if rec.interval_secs == 0 || rec.stuck_threshold_secs == 0 {
            return Err("recovery intervals must be greater than 0".into());
        }
        if rec.max_attempts == 0 {
            return Err("recovery.max_attempts must be greater than 0".into());
        }
        if rec.backoff_base_secs > rec.backoff_max_secs {
            return Err("recovery.backoff_base_secs must not exceed backoff_max_secs".into());
        }

        let retry = &self.deploy_retry;
        if retry.attempts == 0 {
            return Err("deploy_retry.attempts must be greater than 0".into());
        }
        if retry.backoff_base_ms > retry.backoff_max_ms {
            return Err("deploy_retry.backoff_base_ms must not exceed backoff_max_ms".into());
        }

        if self.reconcile_interval_secs == 0 {
            return Err("reconcile_interval_secs must be greater than 0".into());
        }
        if self.lock_timeout_ms == 0 || self.lock_lease_secs == 0 {
            return Err("lock_timeout_ms and lock_lease_secs must be greater than 0".into());
        }
        if self.dispatch_poll_ms == 0 {
            return Err("dispatch_poll_ms must be greater than 0".into());
        }
        if self.audit_capacity == 0 {
            return Err("audit_capacity must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env`, then the JSON file named by `BOTPOOL_CONFIG` (defaults
    /// when unset), then `BOTPOOL_*` overrides.
    pub fn from_env() -> AppResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env");
            }
        }
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading scheduler config {path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing scheduler config {path}"))?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())
            .map_err(anyhow::Error::msg)?;
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Apply `BOTPOOL_*` overrides read through `lookup`.
    ///
    /// Recognized keys: `MAX_CONCURRENT_DEPLOYMENTS`, `QUEUE_TIMEOUT_SECS`,
    /// `BACKEND_PRIORITY` (comma separated), `HEARTBEAT_INTERVAL_SECS`,
    /// `HEARTBEAT_TIMEOUT_SECS`, `IMAGE_PULL_LOCK`, `RECONCILE_INTERVAL_SECS`,
    /// `RECOVERY_MAX_ATTEMPTS`, `QUEUE_PATH`, `LOCK_DIR`, and per backend
    /// `<KIND>_MAX_SLOTS`, `<KIND>_QUEUE_TIMEOUT_SECS`, `<KIND>_ENDPOINT`,
    /// `<KIND>_ENABLED`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("MAX_CONCURRENT_DEPLOYMENTS") {
            self.max_concurrent_deployments = parse_var("MAX_CONCURRENT_DEPLOYMENTS", &v)?;
        }
        if let Some(v) = get("QUEUE_TIMEOUT_SECS") {
            self.queue_timeout_secs = parse_var("QUEUE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("BACKEND_PRIORITY") {
            self.backend_priority = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = get("HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat.interval_secs = parse_var("HEARTBEAT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("HEARTBEAT_TIMEOUT_SECS") {
            self.heartbeat.timeout_secs = parse_var("HEARTBEAT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("IMAGE_PULL_LOCK") {
            self.image_pull_lock_enabled = parse_bool("IMAGE_PULL_LOCK", &v)?;
        }
        if let Some(v) = get("RECONCILE_INTERVAL_SECS") {
            self.reconcile_interval_secs = parse_var("RECONCILE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("RECOVERY_MAX_ATTEMPTS") {
            self.recovery.max_attempts = parse_var("RECOVERY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("QUEUE_PATH") {
            self.queue = QueueBackendConfig::File {
                path: PathBuf::from(v),
                stream: default_stream(),
            };
        }
        if let Some(v) = get("LOCK_DIR") {
            self.lock = LockBackendConfig::File { dir: PathBuf::from(v) };
        }

        for kind in BackendKind::ALL {
            let prefix = kind.as_str().to_ascii_uppercase();
            let key = |suffix: &str| format!("{prefix}_{suffix}");
            let mut touched = self.backends.get(&kind).cloned();

            if let Some(v) = get(&key("MAX_SLOTS")) {
                touched.get_or_insert_with(BackendConfig::default).max_concurrent_slots =
                    Some(parse_var(&key("MAX_SLOTS"), &v)?);
            }
            if let Some(v) = get(&key("QUEUE_TIMEOUT_SECS")) {
                touched.get_or_insert_with(BackendConfig::default).queue_timeout_secs =
                    Some(parse_var(&key("QUEUE_TIMEOUT_SECS"), &v)?);
            }
            if let Some(v) = get(&key("ENDPOINT")) {
                touched.get_or_insert_with(BackendConfig::default).endpoint = Some(v);
            }
            if let Some(v) = get(&key("ENABLED")) {
                touched.get_or_insert_with(BackendConfig::default).enabled =
                    parse_bool(&key("ENABLED"), &v)?;
            }
            if let Some(backend) = touched {
                self.backends.insert(kind, backend);
            }
        }
        Ok(())
    }

    /// Settings for `kind`, defaults when not configured.
    pub fn backend(&self, kind: BackendKind) -> BackendConfig {
        self.backends.get(&kind).cloned().unwrap_or_default()
    }

    /// Whether `kind` may receive requests.
    pub fn is_enabled(&self, kind: BackendKind) -> bool {
        self.backends.get(&kind).is_none_or(|b| b.enabled)
    }

    /// Admission caps and timeouts.
    pub fn queue_limits(&self) -> QueueLimits {
        let mut limits = QueueLimits {
            max_concurrent: self.max_concurrent_deployments,
            timeout: Duration::from_secs(self.queue_timeout_secs),
            poll_interval: Duration::from_millis(self.dispatch_poll_ms),
            ..QueueLimits::default()
        };
        for (kind, backend) in &self.backends {
            if let Some(max) = backend.max_concurrent_slots {
                limits.per_backend.insert(*kind, max);
            }
            if let Some(secs) = backend.queue_timeout_secs {
                limits.backend_timeouts.insert(*kind, Duration::from_secs(secs));
            }
        }
        limits
    }

    /// Heartbeat cadence.
    pub fn heartbeat_timing(&self) -> HeartbeatTiming {
        let interval = Duration::from_secs(self.heartbeat.interval_secs);
        HeartbeatTiming {
            interval,
            timeout: Duration::from_secs(self.heartbeat.timeout_secs),
            sweep_interval: self
                .heartbeat
                .sweep_interval_secs
                .map_or(interval * 2, Duration::from_secs),
        }
    }

    /// Recovery policy.
    pub const fn recovery_policy(&self) -> RecoveryPolicy {
        let rec = &self.recovery;
        RecoveryPolicy {
            interval: Duration::from_secs(rec.interval_secs),
            stuck_threshold: Duration::from_secs(rec.stuck_threshold_secs),
            max_attempts: rec.max_attempts,
            backoff: ExponentialBackoff::new(
                Duration::from_secs(rec.backoff_base_secs),
                Duration::from_secs(rec.backoff_max_secs),
            ),
        }
    }

    /// Deploy retry policy.
    pub const fn deploy_retry_policy(&self) -> DeployRetry {
        DeployRetry {
            attempts: self.deploy_retry.attempts,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(self.deploy_retry.backoff_base_ms),
                Duration::from_millis(self.deploy_retry.backoff_max_ms),
            ),
        }
    }

    /// Lease and polling for the advisory lock.
    pub fn lock_timing(&self) -> LockTiming {
        LockTiming {
            lease: Duration::from_secs(self.lock_lease_secs),
            ..LockTiming::default()
        }
    }

    /// Longest wait for an advisory lock.
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Pause between reconciliation passes.
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{ENV_PREFIX}{name}: cannot parse `{value}`"))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("{ENV_PREFIX}{name}: expected a boolean, got `{value}`")),
    }
}

const fn default_true() -> bool {
    true
}

fn default_stream() -> String {
    "deployments".into()
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_heartbeat_interval_secs() -> u64 {
    10
}

const fn default_heartbeat_timeout_secs() -> u64 {
    30
}

const fn default_recovery_interval_secs() -> u64 {
    60
}

const fn default_stuck_threshold_secs() -> u64 {
    600
}

const fn default_recovery_max_attempts() -> u32 {
    5
}

const fn default_recovery_backoff_base_secs() -> u64 {
    30
}

const fn default_recovery_backoff_max_secs() -> u64 {
    600
}

const fn default_deploy_attempts() -> u32 {
    3
}

const fn default_deploy_backoff_base_ms() -> u64 {
    200
}

const fn default_deploy_backoff_max_ms() -> u64 {
    5_000
}

const fn default_max_concurrent_deployments() -> u32 {
    10
}

const fn default_queue_timeout_secs() -> u64 {
    300
}

fn default_backend_priority() -> Vec<BackendKind> {
    BackendKind::ALL.to_vec()
}

const fn default_reconcile_interval_secs() -> u64 {
    300
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

const fn default_lock_lease_secs() -> u64 {
    30
}

const fn default_dispatch_poll_ms() -> u64 {
    1_000
}

const fn default_audit_capacity() -> usize {
    10_000
}
