//! Tests for utility functions

use std::time::Duration;

use prometheus_bot_pool::util::{add_ms, elapsed_ms, BackendKind, ExponentialBackoff, Priority};

#[test]
fn test_priority_ordering() {
    assert!(Priority::HIGHEST < Priority::DEFAULT);
    assert!(Priority::DEFAULT < Priority::LOWEST);
    assert_eq!(Priority::default().value(), 50);
    assert_eq!(Priority::new(250), Priority::LOWEST);
}

#[test]
fn test_backend_kind_names() {
    assert_eq!("container-task".parse::<BackendKind>().unwrap(), BackendKind::ContainerTask);
    assert_eq!(" PAAS ".parse::<BackendKind>().unwrap(), BackendKind::Paas);
    assert!("mainframe".parse::<BackendKind>().is_err());
    assert_eq!(BackendKind::ContainerTask.platform_label(), "container-task");
    assert_eq!(BackendKind::Local.pool_lock_key(), "slot-pool:local");
    assert_eq!(BackendKind::Paas.inventory_lock_key(), "slot-inventory:paas");
}

#[test]
fn test_backoff_caps() {
    let backoff = ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(600));
    assert_eq!(backoff.delay(0), Duration::ZERO);
    assert_eq!(backoff.delay(1), Duration::from_secs(30));
    assert_eq!(backoff.delay(3), Duration::from_secs(120));
    assert_eq!(backoff.delay(40), Duration::from_secs(600));
}

#[test]
fn test_clock_helpers() {
    assert_eq!(add_ms(1_000, Duration::from_secs(2)), 3_000);
    assert_eq!(elapsed_ms(5_000, 4_000), 0);
}

#[test]
fn test_init_tracing_is_idempotent() {
    prometheus_bot_pool::util::telemetry::init_tracing();
    prometheus_bot_pool::util::telemetry::init_tracing();
    assert!(tracing::dispatcher::has_been_set());
}
