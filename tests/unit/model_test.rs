//! Tests for slot and request records

use prometheus_bot_pool::core::{DeploymentRequest, InstanceRef, Slot, SlotFilter, SlotPatch, SlotStatus};
use prometheus_bot_pool::util::serde::{BackendKind, Priority};

fn slot() -> Slot {
    Slot::new("paas-slot-1", BackendKind::Paas, InstanceRef::new("svc-1"), 1_000)
}

#[test]
fn test_new_slot_is_idle() {
    let slot = slot();
    assert_eq!(slot.status, SlotStatus::Idle);
    assert_eq!(slot.assigned_bot, None);
    assert_eq!(slot.last_used_at_ms, 0);
    assert_eq!(Slot::slot_name(BackendKind::ContainerTask, 3), "container-task-slot-3");
}

#[test]
fn test_patches_keep_bot_consistent() {
    let mut slot = slot();
    SlotPatch::deploying("bot-1").apply(&mut slot, 2_000);
    assert_eq!(slot.status, SlotStatus::Deploying);
    assert_eq!(slot.assigned_bot.as_deref(), Some("bot-1"));
    assert_eq!(slot.status_changed_at_ms, 2_000);

    SlotPatch::busy().apply(&mut slot, 3_000);
    assert_eq!(slot.assigned_bot.as_deref(), Some("bot-1"));

    SlotPatch::idle(4_000).apply(&mut slot, 4_000);
    assert_eq!(slot.status, SlotStatus::Idle);
    assert_eq!(slot.assigned_bot, None);
    assert_eq!(slot.last_used_at_ms, 4_000);
}

#[test]
fn test_filters() {
    let mut slot = slot();
    assert!(SlotFilter::all().matches(&slot));
    assert!(SlotFilter::status(SlotStatus::Idle).on(BackendKind::Paas).matches(&slot));
    assert!(!SlotFilter::status(SlotStatus::Idle).on(BackendKind::Local).matches(&slot));

    SlotPatch::deploying("bot-1").apply(&mut slot, 2_000);
    assert!(SlotFilter::bot("bot-1").matches(&slot));
    assert!(!SlotFilter::bot("bot-2").matches(&slot));
}

#[test]
fn test_request_validation() {
    assert!(DeploymentRequest::new("bot-1").validate().is_ok());
    assert!(DeploymentRequest::new("").validate().is_err());
    assert!(DeploymentRequest::new("bot 1").validate().is_err());
    assert!(DeploymentRequest::new("bot-1").with_image(" ").validate().is_err());
}

#[test]
fn test_request_json_defaults() {
    let request: DeploymentRequest = serde_json::from_str(r#"{ "bot_id": "bot-9", "backend": "paas" }"#).unwrap();
    assert_eq!(request.backend, Some(BackendKind::Paas));
    assert_eq!(request.priority, Priority::DEFAULT);
    assert!(request.summary().starts_with("bot-9 image=<default image>"));
}
