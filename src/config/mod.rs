//! Configuration models for the slot pool, backends and timeouts.

pub mod pool;

pub use pool::{
    BackendConfig, DeployRetryConfig, HeartbeatConfig, LockBackendConfig, QueueBackendConfig, RecoveryConfig,
    SchedulerConfig, CONFIG_PATH_ENV, ENV_PREFIX,
};
