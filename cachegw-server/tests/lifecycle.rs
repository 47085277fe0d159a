use std::sync::Arc;
use std::time::Duration;

use cachegw_client::MemoryConnector;
use cachegw_common::{GatewayError, PoolConfig, PoolError};
use cachegw_server::{GatewayConfig, LifecycleManager, LifecycleState, StartupError};

fn config(max_connections: usize) -> GatewayConfig {
    GatewayConfig {
        pool: PoolConfig {
            max_connections,
            ..PoolConfig::default()
        },
        drain_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}

#[tokio::test]
async fn start_runs_preflight_and_becomes_ready() {
    let connector = MemoryConnector::new();
    let lifecycle = LifecycleManager::start(connector.clone(), &config(4))
        .await
        .expect("start");

    assert_eq!(lifecycle.state(), LifecycleState::Ready);
    assert_eq!(connector.connects(), 1);
    assert_eq!(lifecycle.gateway().pool().stats().idle, 1);
}

#[tokio::test]
async fn unreachable_backend_fails_startup() {
    let connector = MemoryConnector::new();
    connector.refuse_connects(true);

    let result = LifecycleManager::start(connector, &config(4)).await;
    assert!(matches!(
        result,
        Err(StartupError::Preflight(PoolError::Connect(_)))
    ));
}

#[tokio::test]
async fn skipped_preflight_starts_optimistically() {
    let connector = MemoryConnector::new();
    connector.refuse_connects(true);
    let config = GatewayConfig {
        preflight: false,
        ..config(4)
    };

    let lifecycle = LifecycleManager::start(connector.clone(), &config)
        .await
        .expect("start");
    assert_eq!(lifecycle.state(), LifecycleState::Ready);

    let err = lifecycle.gateway().get("key").await.expect_err("backend down");
    assert!(matches!(err, GatewayError::BackendUnavailable(_)));

    connector.refuse_connects(false);
    assert_eq!(lifecycle.gateway().get("key").await.expect("get"), None);
}

#[tokio::test]
async fn invalid_config_fails_startup() {
    let result = LifecycleManager::start(MemoryConnector::new(), &config(0)).await;
    assert!(matches!(result, Err(StartupError::Config(_))));
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let connector = MemoryConnector::new();
    let lifecycle = LifecycleManager::start(connector.clone(), &config(8))
        .await
        .expect("start");
    let gateway = lifecycle.gateway();

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(gateway.pool().borrow().await.expect("borrow"));
    }
    for handle in handles {
        gateway.pool().release(handle);
    }
    assert_eq!(connector.connects(), 5);

    let report = lifecycle.shutdown().await;
    assert_eq!(report.connections_closed, 5);
    assert!(!report.timed_out);
    assert_eq!(connector.closes(), 5);
    assert_eq!(lifecycle.state(), LifecycleState::Closed);

    let err = gateway.get("key").await.expect_err("closed");
    assert!(matches!(err, GatewayError::ServiceShuttingDown));
    assert!(matches!(gateway.pool().borrow().await, Err(PoolError::Closed)));
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_operations() {
    let connector = MemoryConnector::new();
    let lifecycle = Arc::new(
        LifecycleManager::start(connector.clone(), &config(4))
            .await
            .expect("start"),
    );
    connector.set_latency(Duration::from_millis(100));

    let worker = lifecycle.clone();
    let inflight = tokio::spawn(async move { worker.gateway().set("key", b"value").await });
    while lifecycle.gateway().inflight() == 0 {
        tokio::task::yield_now().await;
    }

    let mut states = lifecycle.subscribe();
    let report = lifecycle.shutdown().await;

    assert!(inflight.await.expect("task").expect("set"));
    assert!(!report.timed_out);
    assert_eq!(connector.value("key").as_deref(), Some(&b"value"[..]));
    assert_eq!(connector.closes(), connector.connects());
    assert!(states.has_changed().expect("sender alive"));
    assert_eq!(*states.borrow_and_update(), LifecycleState::Closed);
}

#[tokio::test]
async fn drain_timeout_is_reported() {
    let connector = MemoryConnector::new();
    let config = GatewayConfig {
        drain_timeout: Duration::from_millis(20),
        ..config(4)
    };
    let lifecycle = Arc::new(
        LifecycleManager::start(connector.clone(), &config)
            .await
            .expect("start"),
    );
    connector.set_latency(Duration::from_millis(200));

    let worker = lifecycle.clone();
    let inflight = tokio::spawn(async move { worker.gateway().get("key").await });
    while lifecycle.gateway().inflight() == 0 {
        tokio::task::yield_now().await;
    }

    let report = lifecycle.shutdown().await;
    assert!(report.timed_out);
    assert_eq!(lifecycle.state(), LifecycleState::Closed);
    assert_eq!(inflight.await.expect("task").expect("get"), None);
}

#[tokio::test]
async fn second_shutdown_waits_for_the_first() {
    let connector = MemoryConnector::new();
    let lifecycle = Arc::new(
        LifecycleManager::start(connector.clone(), &config(4))
            .await
            .expect("start"),
    );

    let first = lifecycle.clone();
    let second = lifecycle.clone();
    let (a, b) = tokio::join!(
        async move { first.shutdown().await },
        async move { second.shutdown().await }
    );

    assert_eq!(a.connections_closed + b.connections_closed, 1);
    assert_eq!(lifecycle.state(), LifecycleState::Closed);
    assert_eq!(connector.closes(), 1);
}
