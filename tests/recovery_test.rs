//! Recovery of error and stuck slots.

mod common;

use std::time::Duration;

use common::{fast_config, harness, local_request};
use prometheus_bot_pool::core::{
    AuditAction, BotTerminalStatus, InstanceStatus, PlatformBackend, SchedulerError, SlotFilter, SlotStatus,
    SlotStore,
};
use prometheus_bot_pool::util::clock::now_ms;
use prometheus_bot_pool::util::serde::BackendKind;

#[tokio::test]
async fn test_error_slot_with_live_instance_goes_idle() {
    let h = harness(fast_config());
    let slot = h.scheduler.provision(BackendKind::Local, 1).await.unwrap().remove(0);
    h.scheduler.allocator().mark_error(slot.id, "health check failed").await.unwrap();

    let report = h.scheduler.recovery().run_once(now_ms()).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.recovered, 1);

    let after = h.slots.get(slot.id).await.unwrap().unwrap();
    assert_eq!(after.status, SlotStatus::Idle);
    assert_eq!(after.instance, slot.instance);
    assert_eq!(after.error_message, None);
    assert_eq!(h.local.describe(&slot.instance).await.unwrap(), InstanceStatus::Stopped);
    assert_eq!(h.audit.events_for(AuditAction::Recover).len(), 1);
}

#[tokio::test]
async fn test_missing_instance_is_recreated() {
    let h = harness(fast_config());
    let slot = h.scheduler.provision(BackendKind::Paas, 1).await.unwrap().remove(0);
    h.paas.remove_instance(&slot.instance);
    h.scheduler.allocator().mark_error(slot.id, "instance vanished").await.unwrap();

    let report = h.scheduler.recovery().run_once(now_ms()).await.unwrap();
    assert_eq!(report.recovered, 1);

    let after = h.slots.get(slot.id).await.unwrap().unwrap();
    assert_eq!(after.status, SlotStatus::Idle);
    assert_eq!(after.name, slot.name);
    assert_ne!(after.instance, slot.instance);
    assert_eq!(h.paas.describe(&after.instance).await.unwrap(), InstanceStatus::Running);
}

#[tokio::test]
async fn test_stuck_deploy_fails_bot_and_frees_slot() {
    let h = harness(fast_config());
    h.scheduler.provision(BackendKind::Local, 1).await.unwrap();
    let lease = h.scheduler.allocator().claim(BackendKind::Local, "bot-1").await.unwrap();
    // Hand the slot off without confirming, as a crashed deploy would.
    let slot = lease.into_assignment();
    assert_eq!(slot.status, SlotStatus::Deploying);

    let early = h.scheduler.recovery().run_once(now_ms() + 1_000).await.unwrap();
    assert_eq!(early.examined, 0);

    let report = h.scheduler.recovery().run_once(now_ms() + 600_001).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(h.bots.status("bot-1"), Some(BotTerminalStatus::Failed));
    assert_eq!(h.bots.reason("bot-1").as_deref(), Some("deploy stuck"));

    let after = h.slots.get(slot.id).await.unwrap().unwrap();
    assert_eq!(after.status, SlotStatus::Idle);
    assert_eq!(after.assigned_bot, None);
}

#[tokio::test]
async fn test_recovery_gives_up_after_max_attempts() {
    let mut cfg = fast_config();
    cfg.recovery.max_attempts = 2;
    let h = harness(cfg);
    let slot = h.scheduler.provision(BackendKind::Local, 1).await.unwrap().remove(0);
    h.local.remove_instance(&slot.instance);
    h.local
        .fail_next_deploys(SchedulerError::BackendUnavailable("quota".into()), 10);
    h.scheduler.allocator().mark_error(slot.id, "instance vanished").await.unwrap();
    let worker = h.scheduler.recovery();
    let t0 = now_ms();

    let first = worker.run_once(t0).await.unwrap();
    assert_eq!((first.failed, first.exhausted), (1, 0));
    assert_eq!(h.slots.get(slot.id).await.unwrap().unwrap().recovery_attempts, 1);

    // Inside the 30s backoff window nothing is tried.
    let waiting = worker.run_once(t0 + 1_000).await.unwrap();
    assert_eq!(waiting.skipped, 1);

    // Reaching the limit is still allowed one more try.
    let second = worker.run_once(t0 + 31_000).await.unwrap();
    assert_eq!((second.failed, second.exhausted), (1, 0));
    assert_eq!(h.slots.get(slot.id).await.unwrap().unwrap().recovery_attempts, 2);
    assert!(h.audit.events_for(AuditAction::RecoveryExhausted).is_empty());

    let third = worker.run_once(t0 + 92_000).await.unwrap();
    assert_eq!((third.failed, third.exhausted), (1, 1));
    assert_eq!(h.audit.events_for(AuditAction::RecoveryExhausted).len(), 1);

    let parked = h.slots.get(slot.id).await.unwrap().unwrap();
    assert_eq!(parked.status, SlotStatus::Error);
    assert_eq!(parked.recovery_attempts, 3);
    assert!(parked.error_message.unwrap().contains("recovery exhausted"));

    let later = worker.run_once(t0 + 10_000_000).await.unwrap();
    assert_eq!(later.skipped, 1);
    assert_eq!(later.failed, 0);
    let idle = h.slots.list(&SlotFilter::status(SlotStatus::Idle)).await.unwrap();
    assert!(idle.is_empty());
}

#[tokio::test]
async fn test_slow_deploy_does_not_claim_recovered_slot() {
    let h = harness(fast_config());
    let slot = h.scheduler.provision(BackendKind::Local, 1).await.unwrap().remove(0);
    h.local.set_deploy_delay(Duration::from_millis(200));

    let slow = h.scheduler.submit(local_request("bot-a", 50)).await.unwrap();
    let report = h.scheduler.recovery().run_once(now_ms() + 600_001).await.unwrap();
    assert_eq!(report.recovered, 1);
    let lease = h.scheduler.allocator().claim(BackendKind::Local, "bot-b").await.unwrap();
    assert_eq!(lease.slot().id, slot.id);

    let err = slow.wait().await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTransition(_)), "{err}");
    assert!(!h.scheduler.heartbeats().tracked().contains(&"bot-a".to_owned()));

    let after = h.slots.get(slot.id).await.unwrap().unwrap();
    assert_eq!(after.status, SlotStatus::Deploying);
    assert_eq!(after.assigned_bot.as_deref(), Some("bot-b"));

    let mut lease = lease;
    lease.mark_busy().await.unwrap();
    assert_eq!(lease.into_assignment().assigned_bot.as_deref(), Some("bot-b"));
}
