//! Background loops started and stopped by the supervisor.

mod common;

use std::time::Duration;

use common::{fast_config, harness, local_request};
use prometheus_bot_pool::core::{DeploymentOutcome, SubmitState};
use prometheus_bot_pool::runtime::Supervisor;
use prometheus_bot_pool::util::serde::BackendKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatcher_admits_when_capacity_appears() {
    let h = harness(fast_config());
    let supervisor = Supervisor::start(&h.scheduler).unwrap();
    assert!(supervisor.is_running());

    let ticket = h.scheduler.submit(local_request("bot-1", 50)).await.unwrap();
    assert_eq!(ticket.state(), SubmitState::Queued);

    h.scheduler.provision(BackendKind::Local, 1).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), ticket.wait())
        .await
        .expect("dispatcher admitted the request")
        .unwrap();
    assert!(matches!(outcome, DeploymentOutcome::Deployed(_)));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_all_loops() {
    let h = harness(fast_config());
    let supervisor = Supervisor::start(&h.scheduler).unwrap();
    tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
        .await
        .expect("loops exit on shutdown");
}

#[test]
fn test_start_outside_runtime_fails() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let h = rt.block_on(async { harness(fast_config()) });
    assert!(Supervisor::start(&h.scheduler).is_err());
}
