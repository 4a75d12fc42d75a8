//! Tests for configuration validation

use std::collections::HashMap;
use std::path::PathBuf;

use prometheus_bot_pool::config::{BackendConfig, LockBackendConfig, QueueBackendConfig, SchedulerConfig};
use prometheus_bot_pool::util::serde::BackendKind;

#[test]
fn test_scheduler_config_validation() {
    assert!(SchedulerConfig::default().validate().is_ok());
}

#[test]
fn test_scheduler_config_invalid_concurrency() {
    let config = SchedulerConfig {
        max_concurrent_deployments: 0,
        ..SchedulerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_scheduler_config_duplicate_priority() {
    let config = SchedulerConfig {
        backend_priority: vec![BackendKind::Local, BackendKind::Local],
        ..SchedulerConfig::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.contains("twice"), "{err}");
}

#[test]
fn test_heartbeat_timeout_below_interval() {
    let mut config = SchedulerConfig::default();
    config.heartbeat.timeout_secs = 5;
    assert!(config.validate().is_err());
}

#[test]
fn test_backend_config_invalid_cap() {
    let mut config = SchedulerConfig::default();
    config.backends.insert(
        BackendKind::Paas,
        BackendConfig {
            max_concurrent_slots: Some(0),
            ..BackendConfig::default()
        },
    );
    let err = config.validate().unwrap_err();
    assert!(err.contains("paas"), "{err}");
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "max_concurrent_deployments": 4,
        "backend_priority": ["local", "paas"],
        "backends": {
            "paas": { "endpoint": "http://paas.internal:3000", "max_concurrent_slots": 8 },
            "local": { "command": "meeting-bot", "args": ["--headless"] }
        },
        "heartbeat": { "timeout_secs": 45 },
        "queue": { "kind": "file", "path": "/var/lib/botpool/queue" },
        "lock": { "kind": "file", "dir": "/var/lib/botpool/locks" }
    }"#;

    let config = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(config.max_concurrent_deployments, 4);
    assert_eq!(config.queue_timeout_secs, 300);
    assert_eq!(config.heartbeat.interval_secs, 10);
    assert_eq!(config.heartbeat.timeout_secs, 45);
    assert_eq!(config.backend(BackendKind::Paas).max_concurrent_slots, Some(8));
    assert_eq!(config.backend(BackendKind::Local).args, vec!["--headless".to_owned()]);
    assert_eq!(
        config.queue,
        QueueBackendConfig::File {
            path: PathBuf::from("/var/lib/botpool/queue"),
            stream: "deployments".into(),
        }
    );
    assert_eq!(
        config.lock,
        LockBackendConfig::File {
            dir: PathBuf::from("/var/lib/botpool/locks"),
        }
    );
}

#[test]
fn test_scheduler_config_from_invalid_json() {
    assert!(SchedulerConfig::from_json_str("{ not json").is_err());
    assert!(SchedulerConfig::from_json_str(r#"{ "queue_timeout_secs": 0 }"#).is_err());
}

#[test]
fn test_per_backend_limits() {
    let mut config = SchedulerConfig::default();
    let vars: HashMap<&str, &str> = [
        ("BOTPOOL_PAAS_QUEUE_TIMEOUT_SECS", "60"),
        ("BOTPOOL_LOCAL_MAX_SLOTS", "3"),
        ("BOTPOOL_QUEUE_PATH", "/tmp/botpool"),
    ]
    .into_iter()
    .collect();
    config
        .apply_overrides(|k| vars.get(k).map(|v| (*v).to_owned()))
        .unwrap();

    let limits = config.queue_limits();
    assert_eq!(limits.timeout_for(BackendKind::Paas).as_secs(), 60);
    assert_eq!(limits.timeout_for(BackendKind::Local).as_secs(), 300);
    assert_eq!(limits.per_backend.get(&BackendKind::Local), Some(&3));
    assert!(matches!(config.queue, QueueBackendConfig::File { .. }));
}

#[test]
fn test_unknown_backend_in_priority_override() {
    let mut config = SchedulerConfig::default();
    let err = config
        .apply_overrides(|k| (k == "BOTPOOL_BACKEND_PRIORITY").then(|| "paas,mainframe".to_owned()))
        .unwrap_err();
    assert!(err.contains("mainframe"), "{err}");
}
