use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use service_state::{
    worker_impl, Config, Coordinator, CoordinatorError, HealthCheckWorker, Message,
    ProbeSignaler, ProbeStatus, ReadinessSignaler, ServiceSignal, WorkerError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Signaler with no signal trapping and short shutdown bounds so tests don't hang.
fn test_signaler() -> ProbeSignaler {
    ProbeSignaler::builder()
        .with_trap_signals(false)
        .with_beacon_timeout(Duration::from_secs(5))
        .with_shutdown_handler_timeout(Duration::from_secs(5))
        .build()
}

fn test_config() -> Config {
    Config {
        worker_name: "test-health-checker".to_string(),
        trap_signals: false,
        ..Config::default()
    }
}

async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !check() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check())
}

async fn wait_shutdown(signaler: &ProbeSignaler) {
    tokio::time::timeout(Duration::from_secs(10), signaler.wait_for_shutdown())
        .await
        .expect("shutdown did not complete");
}

async fn worker_exit(coordinator: &Coordinator) -> Result<(), CoordinatorError> {
    tokio::time::timeout(Duration::from_secs(10), coordinator.worker_exit())
        .await
        .expect("worker did not exit")
}

fn counting_ready(calls: Arc<AtomicUsize>) -> impl Fn(ServiceSignal) -> futures::future::Ready<()> {
    move |signal: ServiceSignal| {
        calls.fetch_add(1, Ordering::SeqCst);
        signal.ready();
        futures::future::ready(())
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_checkers_drive_readiness() {
    let signaler = test_signaler();
    let worker = worker_impl("checkers", |worker: &mut HealthCheckWorker| {
        for service in ["db", "cache"] {
            worker.add_health_checker(
                service,
                |signal: ServiceSignal| async move { signal.ready() },
                Duration::from_millis(10),
            )?;
        }
        Ok(())
    });

    let coordinator = Coordinator::start(
        ["db", "cache"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();
    assert!(!coordinator.is_ready());
    assert_eq!(signaler.health(), ProbeStatus::NotReady);

    assert_or_retry(|| coordinator.is_ready()).await;
    assert!(signaler.is_server_ready());
    assert_eq!(signaler.health(), ProbeStatus::Ready);

    coordinator.shutdown();
    wait_shutdown(&signaler).await;
    assert!(worker_exit(&coordinator).await.is_ok());
}

#[tokio::test]
async fn direct_signals_combine_with_worker_checkers() {
    let signaler = test_signaler();
    let worker = worker_impl("db-checker", |worker: &mut HealthCheckWorker| {
        worker.add_health_checker(
            "db",
            |signal: ServiceSignal| async move { signal.ready() },
            Duration::from_millis(10),
        )
    });

    let coordinator = Coordinator::start(
        ["server", "db"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    assert_or_retry(|| coordinator.snapshot().get("db") == Some(&true)).await;
    assert!(!coordinator.is_ready());

    coordinator.signal_ready("server").unwrap();
    assert!(coordinator.is_ready());
    assert!(signaler.is_server_ready());

    coordinator.signal_not_ready("server").unwrap();
    assert!(!signaler.is_server_ready());

    coordinator.shutdown();
    wait_shutdown(&signaler).await;
    assert!(worker_exit(&coordinator).await.is_ok());
}

#[tokio::test]
async fn direct_signal_for_unknown_service_is_rejected() {
    let signaler = test_signaler();
    let worker = worker_impl("idle", |_: &mut HealthCheckWorker| Ok(()));

    let coordinator = Coordinator::start(
        ["server"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    assert!(coordinator.signal_ready("cache").is_err());
    assert!(!coordinator.is_ready());
    assert!(!signaler.is_shutting_down());

    coordinator.shutdown();
    wait_shutdown(&signaler).await;
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_service_from_worker_is_fatal() {
    let signaler = test_signaler();
    let worker = worker_impl("rogue", |worker: &mut HealthCheckWorker| {
        worker.add_health_checker(
            "cache",
            |signal: ServiceSignal| async move { signal.ready() },
            Duration::from_millis(10),
        )
    });

    let coordinator = Coordinator::start(
        ["server"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    let result = worker_exit(&coordinator).await;
    assert!(matches!(
        result,
        Err(CoordinatorError::WorkerFailed(WorkerError::Fault(error))) if error.contains("cache")
    ));

    // a failed worker takes the service down
    wait_shutdown(&signaler).await;
    assert!(signaler.is_shutting_down());
    assert_eq!(coordinator.snapshot().get("server"), Some(&false));
}

#[tokio::test]
async fn multi_service_update_shuts_down() {
    let signaler = test_signaler();
    let worker = worker_impl("raw", |worker: &mut HealthCheckWorker| {
        let sender = worker.signaling_channel().ok_or(WorkerError::NotReady)?;
        let mut update = Map::new();
        update.insert("a".to_string(), Value::Bool(true));
        update.insert("b".to_string(), Value::Bool(true));
        sender
            .send(Message::Update(update))
            .map_err(|e| WorkerError::Fault(e.to_string()))
    });

    let coordinator = Coordinator::start(
        ["a", "b"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    wait_shutdown(&signaler).await;
    assert!(signaler.is_shutting_down());
    assert_eq!(signaler.live(), ProbeStatus::ShuttingDown);
    assert!(!coordinator.is_ready());
    assert_eq!(
        coordinator.snapshot(),
        BTreeMap::from([("a".to_string(), false), ("b".to_string(), false)])
    );

    // the shutdown handler closes the channel, so the worker drains cleanly
    assert!(worker_exit(&coordinator).await.is_ok());
}

#[tokio::test]
async fn non_boolean_update_is_fatal_for_the_worker() {
    let signaler = test_signaler();
    let worker = worker_impl("typo", |worker: &mut HealthCheckWorker| {
        let sender = worker.signaling_channel().ok_or(WorkerError::NotReady)?;
        let update = serde_json::from_value(json!({"db": "yes"}))
            .map_err(|e| WorkerError::Fault(e.to_string()))?;
        sender
            .send(update)
            .map_err(|e| WorkerError::Fault(e.to_string()))
    });

    let coordinator = Coordinator::start(
        ["db"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    let result = worker_exit(&coordinator).await;
    assert!(matches!(
        result,
        Err(CoordinatorError::WorkerFailed(WorkerError::Fault(error))) if error.contains("string")
    ));
    assert_eq!(coordinator.snapshot().get("db"), Some(&false));
    wait_shutdown(&signaler).await;
}

#[tokio::test]
async fn panicking_check_fails_the_worker() {
    let signaler = test_signaler();
    let calls = Arc::new(AtomicUsize::new(0));
    let checker_calls = calls.clone();
    let worker = worker_impl("flaky", move |worker: &mut HealthCheckWorker| {
        let calls = checker_calls.clone();
        worker.add_health_checker(
            "db",
            move |signal: ServiceSignal| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call > 0 {
                        panic!("db client poisoned");
                    }
                    signal.ready();
                }
            },
            Duration::from_millis(20),
        )
    });

    let coordinator = Coordinator::start(
        ["db"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    let result = worker_exit(&coordinator).await;
    assert!(matches!(
        result,
        Err(CoordinatorError::WorkerFailed(WorkerError::CheckPanicked(checker))) if checker == "db"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // readiness does not stay frozen at the last reported value
    wait_shutdown(&signaler).await;
    assert!(signaler.is_shutting_down());
    assert!(!signaler.is_server_ready());
    assert_eq!(signaler.health(), ProbeStatus::ShuttingDown);
}

#[tokio::test]
async fn fault_message_from_worker_is_rejected() {
    let signaler = test_signaler();
    let worker = worker_impl("confused", |worker: &mut HealthCheckWorker| {
        let sender = worker.signaling_channel().ok_or(WorkerError::NotReady)?;
        sender
            .send(Message::fault("checker reported garbage"))
            .map_err(|e| WorkerError::Fault(e.to_string()))
    });

    let coordinator = Coordinator::start(
        ["db"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    let result = worker_exit(&coordinator).await;
    assert!(matches!(
        result,
        Err(CoordinatorError::WorkerFailed(WorkerError::Fault(error)))
            if error == "Invalid state type: expected \"boolean\", received \"string\""
    ));
    wait_shutdown(&signaler).await;
    assert_eq!(coordinator.snapshot().get("db"), Some(&false));
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_closes_channel_and_stops_checkers() {
    let signaler = test_signaler();
    let calls = Arc::new(AtomicUsize::new(0));
    let checker_calls = calls.clone();
    let worker = worker_impl("counting", move |worker: &mut HealthCheckWorker| {
        worker.add_health_checker(
            "db",
            counting_ready(checker_calls.clone()),
            Duration::from_millis(10),
        )
    });

    let coordinator = Coordinator::start(
        ["db"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();
    assert_or_retry(|| coordinator.is_ready()).await;

    coordinator.shutdown();
    assert!(!signaler.is_server_ready());
    wait_shutdown(&signaler).await;
    assert!(worker_exit(&coordinator).await.is_ok());

    let after_exit = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_exit);
}

#[tokio::test]
async fn ready_signal_is_ignored_while_shutting_down() {
    let signaler = test_signaler();
    let worker = worker_impl("idle", |_: &mut HealthCheckWorker| Ok(()));

    let coordinator = Coordinator::start(
        ["server"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    coordinator.shutdown();
    coordinator.signal_ready("server").unwrap();
    assert!(coordinator.is_ready());
    assert!(!coordinator.is_server_ready());
    assert_eq!(signaler.health(), ProbeStatus::ShuttingDown);

    wait_shutdown(&signaler).await;
    assert!(worker_exit(&coordinator).await.is_ok());
}

#[tokio::test]
async fn worker_exit_can_be_awaited_once() {
    let signaler = test_signaler();
    let worker = worker_impl("idle", |_: &mut HealthCheckWorker| Ok(()));

    let coordinator = Coordinator::start(
        ["server"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    coordinator.shutdown();
    wait_shutdown(&signaler).await;
    assert!(worker_exit(&coordinator).await.is_ok());
    assert!(matches!(
        worker_exit(&coordinator).await,
        Err(CoordinatorError::WorkerGone)
    ));
}

#[tokio::test]
async fn beacons_hold_back_shutdown_handlers() {
    let signaler = test_signaler();
    let worker = worker_impl("idle", |_: &mut HealthCheckWorker| Ok(()));

    let coordinator = Coordinator::start(
        ["server"],
        worker,
        Arc::new(signaler.clone()),
        &test_config(),
    )
    .unwrap();

    let beacon = coordinator.create_beacon();
    coordinator.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!signaler.shutdown_completed());

    beacon.die();
    wait_shutdown(&signaler).await;
    assert!(worker_exit(&coordinator).await.is_ok());
}
