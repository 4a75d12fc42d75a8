//! Tests for audit sink

use prometheus_bot_pool::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};
use prometheus_bot_pool::util::serde::BackendKind;

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);

    let event = build_audit_event(
        "paas-slot-1",
        BackendKind::Paas,
        Some("bot-1"),
        AuditAction::Claim,
        Some("lru".to_string()),
    );

    sink.record(event);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, "paas-slot-1");
    assert_eq!(events[0].bot_id.as_deref(), Some("bot-1"));
    assert_eq!(events[0].action, AuditAction::Claim);
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("s1", BackendKind::Local, None, AuditAction::Provision, None));
    sink.record(build_audit_event("s2", BackendKind::Local, None, AuditAction::Provision, None));
    sink.record(build_audit_event("s3", BackendKind::Local, None, AuditAction::Provision, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].subject, "s2"); // First one popped
    assert_eq!(events[1].subject, "s3");
}

#[test]
fn test_events_for_filters_by_action() {
    let sink = InMemoryAuditSink::new(10);
    sink.record(build_audit_event("s1", BackendKind::Local, None, AuditAction::Provision, None));
    sink.record(build_audit_event("s1", BackendKind::Local, Some("bot-1"), AuditAction::Claim, None));
    sink.record(build_audit_event("s1", BackendKind::Local, None, AuditAction::Release, None));

    let claims = sink.events_for(AuditAction::Claim);
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].bot_id.as_deref(), Some("bot-1"));
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event(
        "orphan-1",
        BackendKind::Cluster,
        None,
        AuditAction::DeleteBackendOrphan,
        Some("reconcile".to_string()),
    );

    assert!(event.event_id.starts_with("orphan-1-delete_backend_orphan-"));
    assert_eq!(event.backend, BackendKind::Cluster);
    assert_eq!(event.detail, Some("reconcile".to_string()));
    assert!(event.created_at_ms > 0);

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["action"], "delete_backend_orphan");
    assert_eq!(json["backend"], "cluster");
}
