//! Tests for builder modules

use std::sync::Arc;

use prometheus_bot_pool::builders::SchedulerBuilder;
use prometheus_bot_pool::config::{LockBackendConfig, QueueBackendConfig, SchedulerConfig};
use prometheus_bot_pool::core::{PlatformBackend, SchedulerError};
use prometheus_bot_pool::infra::InMemoryBackend;
use prometheus_bot_pool::util::serde::BackendKind;

fn backend(kind: BackendKind) -> Arc<dyn PlatformBackend> {
    Arc::new(InMemoryBackend::new(kind))
}

#[tokio::test]
async fn test_builder_priority_follows_config() {
    let config = SchedulerConfig {
        backend_priority: vec![BackendKind::Local, BackendKind::Paas],
        ..SchedulerConfig::default()
    };
    let scheduler = SchedulerBuilder::new(config)
        .with_backend(backend(BackendKind::Paas))
        .with_backend(backend(BackendKind::Local))
        .build()
        .unwrap();
    assert_eq!(scheduler.backends().kinds(), vec![BackendKind::Local, BackendKind::Paas]);
    assert!(scheduler.audit().is_some());
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let config = SchedulerConfig {
        queue_timeout_secs: 0,
        ..SchedulerConfig::default()
    };
    let err = SchedulerBuilder::new(config)
        .with_backend(backend(BackendKind::Local))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, SchedulerError::ConfigInvalid(ref m) if m.contains("queue_timeout_secs")));
}

#[tokio::test]
async fn test_builder_opens_file_stores() {
    let dir = tempfile::tempdir().unwrap();
    let config = SchedulerConfig {
        queue: QueueBackendConfig::File {
            path: dir.path().join("queue"),
            stream: "deployments".into(),
        },
        lock: LockBackendConfig::File {
            dir: dir.path().join("locks"),
        },
        ..SchedulerConfig::default()
    };
    let scheduler = SchedulerBuilder::new(config)
        .with_backend(backend(BackendKind::Local))
        .build()
        .unwrap();
    scheduler.provision(BackendKind::Local, 1).await.unwrap();
    assert!(dir.path().join("locks").is_dir());
    assert!(dir.path().join("queue").is_dir());
}

#[test]
fn test_builder_needs_runtime_without_spawner() {
    let err = SchedulerBuilder::new(SchedulerConfig::default())
        .with_backend(backend(BackendKind::Local))
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("tokio runtime"), "{err}");
}
