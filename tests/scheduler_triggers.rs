//! Scheduler behaviour: startup sweep, event fast path, resubscription and
//! graceful shutdown.

mod support;

use govwatch::coordination::{
    GracefulShutdown, Scheduler, SchedulerSettings, ShutdownConfig, ShutdownPhase, ShutdownSignal,
    TriggerStatus,
};
use govwatch::domain::ProposalId;
use govwatch::execution::{ExecutionEngine, ExecutionLedger};
use std::sync::Arc;
use std::time::Duration;
use support::{engine, wait_until, ScriptedLedger};

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        sweep_interval: Duration::from_secs(3600),
        heartbeat_interval: Duration::from_secs(3600),
        max_concurrent: 2,
        resubscribe_base: Duration::from_millis(10),
        resubscribe_cap: Duration::from_millis(50),
    }
}

fn start(engine: &Arc<ExecutionEngine>) -> (Arc<GracefulShutdown>, Arc<TriggerStatus>, govwatch::coordination::SchedulerHandle) {
    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig {
        drain_timeout: Duration::from_secs(5),
        ..ShutdownConfig::default()
    }));
    let status = Arc::new(TriggerStatus::new());
    let scheduler = Scheduler::new(engine.clone(), settings(), status.clone());
    let handle = scheduler.run(shutdown.token());
    (shutdown, status, handle)
}

/// A proposal eligible before startup is executed exactly once by the first
/// sweep.
#[tokio::test]
async fn startup_sweep_executes_pre_eligible_proposal() {
    let chain = ScriptedLedger::new();
    chain.set_votes(21u64, 250);
    let (engine, ledger) = engine(chain.clone());

    let (shutdown, status, handle) = start(&engine);

    wait_until("startup sweep executes P21", || chain.execute_count(21u64) == 1).await;
    wait_until("startup sweep recorded", || engine.current_generation() == 1).await;
    assert!(
        chain.subscribe_calls() >= 1,
        "subscription is opened before the first sweep"
    );

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    assert!(handle.join().await);

    assert_eq!(chain.execute_count(21u64), 1);
    assert!(ledger.has_executed(&ProposalId::from(21u64)).await.unwrap());
    assert!(status.last_sweep_at().await.is_some());
}

/// New-proposal events are executed without waiting for the next sweep.
#[tokio::test]
async fn event_fast_path_executes_new_proposal() {
    let chain = ScriptedLedger::new();
    let events = chain.push_subscription();
    let (engine, ledger) = engine(chain.clone());

    let (shutdown, status, handle) = start(&engine);
    wait_until("subscription connected", || status.is_subscription_connected()).await;
    wait_until("startup sweep done", || engine.current_generation() == 1).await;

    // Created after the startup sweep, not listed until the next one
    chain.set_unlisted_votes(22u64, 180);
    events.send(ProposalId::from(22u64)).unwrap();
    // Duplicate delivery is harmless
    events.send(ProposalId::from(22u64)).unwrap();

    wait_until("event executes P22", || chain.execute_count(22u64) == 1).await;

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    assert!(handle.join().await);

    assert_eq!(chain.execute_count(22u64), 1);
    assert!(ledger.has_executed(&ProposalId::from(22u64)).await.unwrap());
    assert_eq!(status.events_received(), 2);
}

/// A below-quorum event is left for a later trigger.
#[tokio::test]
async fn event_below_quorum_is_not_executed() {
    let chain = ScriptedLedger::new();
    let events = chain.push_subscription();
    let (engine, ledger) = engine(chain.clone());

    let (shutdown, status, handle) = start(&engine);
    wait_until("subscription connected", || status.is_subscription_connected()).await;

    chain.set_unlisted_votes(23u64, 99);
    events.send(ProposalId::from(23u64)).unwrap();
    wait_until("event received", || status.events_received() == 1).await;

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    assert!(handle.join().await);

    assert_eq!(chain.execute_count(23u64), 0);
    assert!(ledger.entry(&ProposalId::from(23u64)).await.unwrap().is_none());
}

/// Failed and ended subscriptions are re-established.
#[tokio::test]
async fn subscription_is_reestablished() {
    let chain = ScriptedLedger::new();
    chain.push_subscription_failure("connection refused");
    let first = chain.push_subscription();
    let second = chain.push_subscription();
    let (engine, _ledger) = engine(chain.clone());

    let (shutdown, status, handle) = start(&engine);
    wait_until("subscription connected", || status.is_subscription_connected()).await;
    assert!(chain.subscribe_calls() >= 2);

    // Stream ends
    drop(first);
    wait_until("resubscribed after stream end", || chain.subscribe_calls() >= 3).await;

    chain.set_unlisted_votes(24u64, 300);
    second.send(ProposalId::from(24u64)).unwrap();
    wait_until("event on new subscription executes", || chain.execute_count(24u64) == 1).await;
    assert!(status.resubscribes() >= 2);

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    assert!(handle.join().await);
}

/// Shutdown waits for an in-flight execution instead of aborting it.
#[tokio::test]
async fn shutdown_drains_in_flight_execution() {
    let chain = ScriptedLedger::new();
    let events = chain.push_subscription();
    chain.set_execute_delay(Duration::from_millis(200));
    let (engine, ledger) = engine(chain.clone());

    let (shutdown, status, handle) = start(&engine);
    wait_until("subscription connected", || status.is_subscription_connected()).await;
    wait_until("startup sweep done", || engine.current_generation() == 1).await;

    chain.set_unlisted_votes(25u64, 400);
    events.send(ProposalId::from(25u64)).unwrap();
    wait_until("execution in flight", || chain.execute_count(25u64) == 1).await;

    shutdown.request_shutdown(ShutdownSignal::Graceful);

    let stopping = engine.clone();
    let flushing = engine.clone();
    let report = shutdown
        .execute(
            move || {
                Box::pin(async move {
                    stopping.stop_accepting();
                })
            },
            move || Box::pin(handle.join()),
            move || {
                Box::pin(async move { flushing.ledger().flush().await.map_err(|e| e.to_string()) })
            },
        )
        .await
        .unwrap();

    assert!(report.drained);
    assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    assert!(
        ledger.has_executed(&ProposalId::from(25u64)).await.unwrap(),
        "in-flight execution completes and is recorded before shutdown finishes"
    );
    assert!(!engine.is_accepting());
}
