//! Tests for error types

use prometheus_bot_pool::core::SchedulerError;

#[test]
fn test_none_available_error() {
    let err = SchedulerError::NoneAvailable("paas".to_string());
    assert_eq!(format!("{err}"), "no idle slot available on paas");
    assert!(err.is_capacity());
}

#[test]
fn test_queue_timeout_error() {
    let err = SchedulerError::QueueTimeout("bot-1".to_string());
    assert_eq!(format!("{err}"), "queue timeout for bot bot-1");
    assert!(!err.is_transient());
}

#[test]
fn test_recovery_exhausted_error() {
    let err = SchedulerError::RecoveryExhausted("local-slot-2".to_string());
    assert_eq!(format!("{err}"), "recovery exhausted for slot local-slot-2");
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("connection failed".to_string());
    assert_eq!(format!("{err}"), "backend error: connection failed");
}

#[test]
fn test_io_errors_map_to_store() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
    let err: SchedulerError = io.into();
    assert!(matches!(err, SchedulerError::Store(_)));
}
