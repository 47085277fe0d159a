use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use cachegw_client::{BackendConnection, ConnectionPool, MemoryConnector};
use cachegw_common::{PoolConfig, PoolError};

fn config(max_connections: usize, acquire_timeout: Duration) -> PoolConfig {
    PoolConfig {
        max_connections,
        acquire_timeout,
        ..PoolConfig::default()
    }
}

fn pool_with(connector: &MemoryConnector, max_connections: usize) -> ConnectionPool<MemoryConnector> {
    ConnectionPool::new(connector.clone(), config(max_connections, Duration::from_secs(5)))
        .expect("valid config")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn released_connection_is_reused() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 4);

    let handle = pool.borrow().await.expect("borrow");
    let first_id = handle.id();
    pool.release(handle);

    let handle = pool.borrow().await.expect("borrow again");
    assert_eq!(handle.id(), first_id);
    assert_eq!(connector.connects(), 1);
    pool.release(handle);

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.live, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outstanding_handles_never_exceed_max_connections() {
    let connector = MemoryConnector::with_latency(Duration::from_millis(10));
    let pool = pool_with(&connector, 10);

    let mut tasks = Vec::new();
    for idx in 0..100 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut handle = pool.borrow().await?;
            let key = format!("key-{idx}");
            let _ = handle.get(&key).await;
            pool.release(handle);
            Ok::<_, PoolError>(())
        }));
    }
    for task in tasks {
        task.await.expect("task").expect("borrow");
    }

    let stats = pool.stats();
    assert!(stats.peak_outstanding <= 10, "peak {}", stats.peak_outstanding);
    assert!(connector.peak_concurrent_ops() <= 10);
    assert!(connector.connects() <= 10);
    assert_eq!(stats.outstanding, 0);
    assert!(stats.saturated > 0);
}

#[tokio::test]
async fn borrow_fails_with_exhausted_after_timeout() {
    let connector = MemoryConnector::new();
    let pool = ConnectionPool::new(connector, config(1, Duration::from_millis(50))).expect("pool");

    let held = pool.borrow().await.expect("first borrow");
    let err = pool.borrow().await.err().expect("second borrow must fail");
    assert!(matches!(err, PoolError::Exhausted { waited } if waited >= Duration::from_millis(50)));

    let stats = pool.stats();
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.outstanding, 1);

    pool.release(held);
    let again = pool.borrow().await.expect("borrow after release");
    pool.release(again);
}

#[tokio::test]
async fn waiters_are_served_in_fifo_order() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.borrow().await.expect("borrow");
    let mut waiters = Vec::new();
    for idx in 0..3 {
        let pool_for_task = pool.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let handle = pool_for_task.borrow().await.expect("waiter borrow");
            order.lock().push(idx);
            pool_for_task.release(handle);
        }));
        let queued = idx + 1;
        let pool = pool.clone();
        eventually(move || pool.stats().waiting == queued).await;
    }

    pool.release(held);
    for waiter in waiters {
        waiter.await.expect("waiter");
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn discarded_connection_is_never_handed_out_again() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 2);

    let broken = pool.borrow().await.expect("borrow");
    let broken_id = broken.id();
    pool.discard(broken);

    for _ in 0..10 {
        let handle = pool.borrow().await.expect("borrow");
        assert_ne!(handle.id(), broken_id);
        pool.release(handle);
    }

    let stats = pool.stats();
    assert_eq!(stats.discarded, 1);
    assert!(stats.live <= 2);

    pool.drain().await;
    assert_eq!(connector.closes(), connector.connects());
}

#[tokio::test]
async fn discard_replaces_the_connection_in_the_background() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 2);

    let handle = pool.borrow().await.expect("borrow");
    pool.discard(handle);

    let stats_pool = pool.clone();
    let observed = connector.clone();
    eventually(move || stats_pool.stats().idle == 1 && observed.closes() == 1).await;
    assert_eq!(connector.connects(), 2);
    assert_eq!(pool.stats().live, 1);
}

#[tokio::test]
async fn replacement_never_pushes_the_pool_past_its_ceiling() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 1);

    let handle = pool.borrow().await.expect("borrow");
    pool.discard(handle);
    // Connects lazily while the background replacement is still pending.
    let handle = pool.borrow().await.expect("borrow during replacement");

    let stats_pool = pool.clone();
    let observed = connector.clone();
    eventually(move || {
        stats_pool.stats().live <= 1 && observed.connects() - observed.closes() <= 1
    })
    .await;

    pool.release(handle);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.live, 1);
    assert!(connector.connects() - connector.closes() <= 1);
}

#[tokio::test]
async fn cancelled_borrow_frees_the_reserved_slot() {
    let connector = MemoryConnector::new();
    connector.set_connect_latency(Duration::from_secs(5));
    let pool = pool_with(&connector, 1);

    let borrow = tokio::time::timeout(Duration::from_millis(20), pool.borrow()).await;
    assert!(borrow.is_err());
    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.discarded, 0);

    connector.set_connect_latency(Duration::ZERO);
    let handle = pool.borrow().await.expect("borrow after cancellation");
    pool.release(handle);
}

#[tokio::test]
async fn dropping_a_handle_discards_it() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 2);

    let handle = pool.borrow().await.expect("borrow");
    let dropped_id = handle.id();
    drop(handle);

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.discarded, 1);

    let handle = pool.borrow().await.expect("borrow");
    assert_ne!(handle.id(), dropped_id);
    pool.release(handle);
}

#[tokio::test]
async fn drain_closes_every_connection_and_rejects_new_borrows() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 5);

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(pool.borrow().await.expect("borrow"));
    }
    assert_eq!(connector.connects(), 5);
    for handle in handles {
        pool.release(handle);
    }

    let report = pool.drain().await;
    assert_eq!(report.closed, 5);
    assert_eq!(connector.closes(), 5);
    assert!(pool.is_closed());
    assert!(matches!(pool.borrow().await, Err(PoolError::Closed)));

    let stats = pool.stats();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.idle, 0);
}

#[tokio::test]
async fn drain_waits_for_outstanding_handles() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 2);
    let held = pool.borrow().await.expect("borrow");

    let drain_pool = pool.clone();
    let drain = tokio::spawn(async move { drain_pool.drain().await });

    sleep(Duration::from_millis(30)).await;
    assert!(!drain.is_finished());
    assert!(matches!(pool.borrow().await, Err(PoolError::Closed)));

    pool.release(held);
    let report = drain.await.expect("drain task");
    assert_eq!(report.closed, 1);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn queued_borrowers_fail_when_drain_starts() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 1);
    let held = pool.borrow().await.expect("borrow");

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.borrow().await.map(|handle| handle.id()) });
    let stats_pool = pool.clone();
    eventually(move || stats_pool.stats().waiting == 1).await;

    let drain_pool = pool.clone();
    let drain = tokio::spawn(async move { drain_pool.drain().await });

    assert!(matches!(waiter.await.expect("waiter"), Err(PoolError::Closed)));
    pool.release(held);
    drain.await.expect("drain");
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn connect_failure_frees_the_reserved_slot() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 1);

    connector.refuse_connects(true);
    assert!(matches!(pool.borrow().await, Err(PoolError::Connect(_))));
    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.live, 0);

    connector.refuse_connects(false);
    let handle = pool.borrow().await.expect("borrow after backend recovers");
    pool.release(handle);
}

#[tokio::test]
async fn warm_up_opens_min_idle_connections() {
    let connector = MemoryConnector::new();
    let config = PoolConfig {
        max_connections: 8,
        min_idle: 3,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::new(connector.clone(), config).expect("pool");

    assert_eq!(pool.warm_up().await.expect("warm up"), 3);
    assert_eq!(pool.stats().idle, 3);
    assert_eq!(connector.connects(), 3);

    let handle = pool.borrow().await.expect("borrow");
    assert_eq!(connector.connects(), 3);
    pool.release(handle);
}

#[tokio::test]
async fn preflight_keeps_a_checked_connection() {
    let connector = MemoryConnector::new();
    let pool = pool_with(&connector, 2);
    pool.preflight().await.expect("preflight");
    assert_eq!(pool.stats().idle, 1);

    let refused = MemoryConnector::new();
    refused.refuse_connects(true);
    let pool = pool_with(&refused, 2);
    assert!(matches!(pool.preflight().await, Err(PoolError::Connect(_))));
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn preflight_closes_connection_that_fails_ping() {
    let connector = MemoryConnector::new();
    connector.fail_next_ops(1);
    let pool = pool_with(&connector, 2);

    assert!(matches!(pool.preflight().await, Err(PoolError::Connect(_))));
    assert_eq!(connector.closes(), 1);
    assert_eq!(pool.stats().idle, 0);
}

#[test]
fn rejects_invalid_config() {
    let config = PoolConfig {
        max_connections: 0,
        ..PoolConfig::default()
    };
    assert!(ConnectionPool::new(MemoryConnector::new(), config).is_err());
}
