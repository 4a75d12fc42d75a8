//! Slot claims across scheduler instances sharing one slot table.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, fast_config, harness};
use prometheus_bot_pool::core::{
    AdvisoryLock, LockStore, PlatformBackend, SchedulerError, SlotAllocator, SlotFilter, SlotStatus, SlotStore,
};
use prometheus_bot_pool::infra::{FileLockStore, InMemoryBackend, InMemorySlotStore};
use prometheus_bot_pool::util::clock::now_ms;
use prometheus_bot_pool::util::serde::BackendKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_slot() {
    let h = harness(fast_config());
    let other = h.sibling();
    h.scheduler.provision(BackendKind::Local, 3).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let allocator = if i % 2 == 0 {
            h.scheduler.allocator().clone()
        } else {
            other.allocator().clone()
        };
        tasks.push(tokio::spawn(async move {
            allocator.claim(BackendKind::Local, &format!("bot-{i}")).await
        }));
    }

    let mut leases = Vec::new();
    let mut none_available = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(lease) => leases.push(lease),
            Err(SchedulerError::NoneAvailable(_)) => none_available += 1,
            Err(e) => panic!("unexpected claim error {e}"),
        }
    }
    assert_eq!(leases.len(), 3);
    assert_eq!(none_available, 7);
    let distinct: HashSet<_> = leases.iter().map(|l| l.slot().id).collect();
    assert_eq!(distinct.len(), 3);

    for lease in leases {
        lease.release().await.unwrap();
    }
    let idle = h
        .slots
        .list(&SlotFilter::status(SlotStatus::Idle))
        .await
        .unwrap();
    assert_eq!(idle.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_files_exclude_separate_allocators() {
    let dir = tempfile::tempdir().unwrap();
    let slots: Arc<dyn SlotStore> = Arc::new(InMemorySlotStore::new());
    let backend: Arc<dyn PlatformBackend> = Arc::new(InMemoryBackend::new(BackendKind::Local));

    let allocator = |slots: Arc<dyn SlotStore>| {
        let locks: Arc<dyn LockStore> = Arc::new(FileLockStore::new(dir.path()).unwrap());
        SlotAllocator::new(slots, AdvisoryLock::new(locks, Default::default()), Duration::from_secs(5))
    };
    let a = allocator(Arc::clone(&slots));
    let b = allocator(Arc::clone(&slots));
    a.provision(backend.as_ref(), 2).await.unwrap();

    let claims = futures::future::join_all((0..6).map(|i| {
        let allocator = if i % 2 == 0 { a.clone() } else { b.clone() };
        async move { allocator.claim(BackendKind::Local, &format!("bot-{i}")).await }
    }))
    .await;

    let won: Vec<_> = claims.into_iter().filter_map(Result::ok).collect();
    assert_eq!(won.len(), 2);
    assert_ne!(won[0].slot().id, won[1].slot().id);
}

#[tokio::test]
async fn test_bot_cannot_hold_two_slots() {
    let h = harness(fast_config());
    h.scheduler.provision(BackendKind::Local, 2).await.unwrap();
    let allocator = h.scheduler.allocator();

    let lease = allocator.claim(BackendKind::Local, "bot-1").await.unwrap();
    let err = allocator.claim(BackendKind::Local, "bot-1").await.err().unwrap();
    assert_eq!(err, SchedulerError::AlreadyAssigned("bot-1".into()));
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_claim_rotates_least_recently_used() {
    let h = harness(fast_config());
    let slots = h.scheduler.provision(BackendKind::Local, 2).await.unwrap();
    let allocator = h.scheduler.allocator();

    let first = allocator.claim(BackendKind::Local, "bot-1").await.unwrap();
    assert_eq!(first.slot().id, slots[0].id);
    first.release().await.unwrap();

    let second = allocator.claim(BackendKind::Local, "bot-2").await.unwrap();
    assert_eq!(second.slot().id, slots[1].id, "the never-used slot goes first");
    second.release().await.unwrap();
}

#[tokio::test]
async fn test_dropped_lease_returns_slot() {
    let h = harness(fast_config());
    h.scheduler.provision(BackendKind::Local, 1).await.unwrap();
    let allocator = h.scheduler.allocator().clone();

    {
        let _lease = allocator.claim(BackendKind::Local, "bot-1").await.unwrap();
    }

    let store = Arc::clone(&h.slots);
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                store
                    .list(&SlotFilter::status(SlotStatus::Idle))
                    .await
                    .map(|s| s.len() == 1)
                    .unwrap_or(false)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_provision_names_continue() {
    let h = harness(fast_config());
    h.scheduler.provision(BackendKind::Paas, 2).await.unwrap();
    let more = h.scheduler.provision(BackendKind::Paas, 1).await.unwrap();
    assert_eq!(more[0].name, "paas-slot-3");

    // Another instance on the same stores sees the same pool.
    let sibling = h.sibling();
    let all = sibling
        .allocator()
        .store()
        .list(&SlotFilter::all().on(BackendKind::Paas))
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_lease_taken_back_by_recovery_cannot_touch_next_owner() {
    let h = harness(fast_config());
    h.scheduler.provision(BackendKind::Local, 1).await.unwrap();
    let allocator = h.scheduler.allocator();

    let mut stale = allocator.claim(BackendKind::Local, "bot-a").await.unwrap();
    let id = stale.slot().id;
    let report = h.scheduler.recovery().run_once(now_ms() + 600_001).await.unwrap();
    assert_eq!(report.recovered, 1);
    let current = allocator.claim(BackendKind::Local, "bot-b").await.unwrap();
    assert_eq!(current.slot().id, id);

    assert!(!stale.is_held().await.unwrap());
    let err = stale.mark_busy().await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTransition(ref m) if m.contains("bot-b")), "{err}");
    let err = stale.release().await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidTransition(_)), "{err}");
    assert!(allocator.release_held(id, "bot-a").await.is_err());

    let slot = h.slots.get(id).await.unwrap().unwrap();
    assert_eq!(slot.status, SlotStatus::Deploying);
    assert_eq!(slot.assigned_bot.as_deref(), Some("bot-b"));
    assert!(current.is_held().await.unwrap());
    current.release().await.unwrap();
}
