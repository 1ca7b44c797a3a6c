//! End-to-end pool lifecycle scenarios against the mock connector.

mod support;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tidepool::{Pool, PoolError, PoolRegistry};
use tidepool_core::Session;

use support::{MockConnector, test_config};

#[tokio::test]
async fn s1_basic_lifecycle() {
    let connector = MockConnector::new();
    let pool = Pool::initialize(test_config(2, 5), connector.clone())
        .await
        .expect("initialize");

    let stats = pool.stats();
    assert_eq!(stats.current_size, 2);
    assert_eq!(stats.current_in_use, 0);
    assert_eq!(stats.connections_created, 2);

    let conn = pool.acquire().await.expect("acquire");
    conn.ping().await.expect("probe-equivalent query");
    conn.release().await;

    let stats = pool.stats();
    assert_eq!(stats.current_in_use, 0);
    assert_eq!(stats.acquisitions, 1);
    assert_eq!(stats.releases, 1);

    pool.close().await;
    let stats = pool.stats();
    assert_eq!(stats.current_size, 0);
    assert_eq!(stats.connections_closed, 2);
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn s2_saturation_serves_the_waiter_on_release() {
    let connector = MockConnector::new();
    let config = test_config(1, 2).acquisition_timeout(Duration::from_millis(500));
    let pool = Pool::initialize(config, connector).await.expect("initialize");

    let first = pool.acquire().await.expect("first");
    let second = pool.acquire().await.expect("second");

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await });

    // Let the third acquire enroll.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.stats().current_waiters, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    first.release().await;

    let third = waiter
        .await
        .expect("waiter task")
        .expect("waiter served with the released connection");
    assert_eq!(pool.stats().peak_waiters, 1);
    assert_eq!(pool.stats().current_waiters, 0);

    third.release().await;
    second.release().await;
    pool.close().await;
}

#[tokio::test]
async fn s3_waiter_times_out_when_nothing_is_released() {
    let connector = MockConnector::new();
    let config = test_config(1, 2).acquisition_timeout(Duration::from_millis(500));
    let pool = Pool::initialize(config, connector).await.expect("initialize");

    let _first = pool.acquire().await.expect("first");
    let _second = pool.acquire().await.expect("second");

    let start = Instant::now();
    let err = pool.acquire().await.expect_err("should time out");
    let elapsed = start.elapsed();

    assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    assert!(elapsed >= Duration::from_millis(500), "waited for deadline");
    assert!(elapsed < Duration::from_millis(800), "did not overshoot");

    let stats = pool.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.current_waiters, 0);

    pool.close().await;
}

#[tokio::test]
async fn s4_failed_connection_is_retired_and_replaced() {
    let connector = MockConnector::new();
    let pool = Pool::initialize(test_config(1, 3), connector.clone())
        .await
        .expect("initialize");

    let mut conn = pool.acquire().await.expect("acquire");
    conn.kill();
    conn.invalidate();
    conn.release().await;

    // The replacement is constructed in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = pool.stats();
    assert_eq!(stats.unhealthy_detected, 1);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.connections_created, 2);
    assert_eq!(stats.current_size, 1);
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 1);

    pool.close().await;
}

#[tokio::test]
async fn s5_connection_is_retired_after_max_usage() {
    let connector = MockConnector::new();
    let config = test_config(1, 3).max_usage_count(3);
    let pool = Pool::initialize(config, connector.clone())
        .await
        .expect("initialize");

    for _ in 0..3 {
        let conn = pool.acquire().await.expect("acquire");
        conn.ping().await.expect("work");
        conn.release().await;
    }
    // usage_count reached 3 on the third acquisition, so the third release
    // retired the connection; the refill runs in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = pool.stats();
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(stats.connections_created, 2);
    assert_eq!(stats.current_size, 1, "minimum restored before next use");

    let conn = pool.acquire().await.expect("fourth acquire");
    assert_eq!(conn.serial, 2, "fourth cycle runs on the replacement");
    conn.release().await;

    pool.close().await;
}

#[tokio::test]
async fn s6_close_drains_waiters_and_holder_release_closes() {
    let connector = MockConnector::new();
    let config = test_config(1, 1).acquisition_timeout(Duration::from_secs(5));
    let pool = Pool::initialize(config, connector.clone())
        .await
        .expect("initialize");

    let held = pool.acquire().await.expect("hold the sole connection");

    let pool_a = pool.clone();
    let waiter_a = tokio::spawn(async move { pool_a.acquire().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pool_b = pool.clone();
    let waiter_b = tokio::spawn(async move { pool_b.acquire().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.close().await;

    // Both waiters fail promptly, not at their own deadlines.
    let drained = tokio::time::timeout(Duration::from_millis(200), async {
        (waiter_a.await, waiter_b.await)
    })
    .await
    .expect("waiters drained promptly");
    assert!(matches!(drained.0, Ok(Err(PoolError::PoolClosed))));
    assert!(matches!(drained.1, Ok(Err(PoolError::PoolClosed))));

    // The held connection is closed on release.
    held.release().await;
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().current_size, 0);
}

#[tokio::test]
async fn dropping_the_guard_returns_the_connection() {
    let connector = MockConnector::new();
    let pool = Pool::initialize(test_config(1, 2), connector)
        .await
        .expect("initialize");

    {
        let _conn = pool.acquire().await.expect("acquire");
        // Dropped here without an explicit release.
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = pool.stats();
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.current_in_use, 0);
    assert_eq!(stats.current_idle, 1);

    pool.close().await;
}

#[tokio::test]
async fn acquire_after_close_fails_and_close_is_idempotent() {
    let connector = MockConnector::new();
    let pool = Pool::initialize(test_config(1, 2), connector.clone())
        .await
        .expect("initialize");

    pool.close().await;
    assert!(pool.is_closed());
    let closed_after_first = pool.stats().connections_closed;

    let err = pool.acquire().await.expect_err("pool is closed");
    assert!(matches!(err, PoolError::PoolClosed));

    pool.close().await;
    pool.close().await;
    assert_eq!(pool.stats().connections_closed, closed_after_first);
    assert_eq!(connector.state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn waiters_are_served_in_enrollment_order() {
    let connector = MockConnector::new();
    let config = test_config(2, 2).acquisition_timeout(Duration::from_secs(5));
    let pool = Pool::initialize(config, connector).await.expect("initialize");

    let first = pool.acquire().await.expect("first");
    let second = pool.acquire().await.expect("second");

    let order = Arc::new(Mutex::new(Vec::new()));

    let pool_a = pool.clone();
    let order_a = Arc::clone(&order);
    let waiter_a = tokio::spawn(async move {
        let conn = pool_a.acquire().await.expect("waiter a");
        order_a.lock().expect("order mutex").push("a");
        conn
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool_b = pool.clone();
    let order_b = Arc::clone(&order);
    let waiter_b = tokio::spawn(async move {
        let conn = pool_b.acquire().await.expect("waiter b");
        order_b.lock().expect("order mutex").push("b");
        conn
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One release serves exactly the head waiter; the guard is held so the
    // second waiter cannot be served by anything but the second release.
    first.release().await;
    let conn_a = waiter_a.await.expect("waiter a completes");
    assert_eq!(*order.lock().expect("order mutex"), vec!["a"]);

    second.release().await;
    let conn_b = waiter_b.await.expect("waiter b completes");
    assert_eq!(*order.lock().expect("order mutex"), vec!["a", "b"]);

    conn_a.release().await;
    conn_b.release().await;
    pool.close().await;
}

#[tokio::test]
async fn cancelled_waiter_never_steals_a_connection() {
    let connector = MockConnector::new();
    let config = test_config(1, 1).acquisition_timeout(Duration::from_secs(5));
    let pool = Pool::initialize(config, connector).await.expect("initialize");

    let held = pool.acquire().await.expect("hold");

    // Enroll a waiter, then cancel it by dropping the future.
    let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
    assert!(cancelled.is_err(), "future dropped before completion");

    held.release().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The released connection went back to the idle set, not to the dead
    // waiter, and a live acquire can use it immediately.
    assert_eq!(pool.stats().current_idle, 1);
    let conn = pool.acquire().await.expect("live acquire");
    conn.release().await;

    pool.close().await;
}

#[tokio::test]
async fn caller_deadline_is_clamped_to_the_configured_timeout() {
    let connector = MockConnector::new();
    let config = test_config(1, 1).acquisition_timeout(Duration::from_millis(200));
    let pool = Pool::initialize(config, connector).await.expect("initialize");

    let _held = pool.acquire().await.expect("hold");

    let start = Instant::now();
    let err = pool
        .acquire_within(Duration::from_secs(60))
        .await
        .expect_err("clamped deadline fires");
    assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    assert!(start.elapsed() < Duration::from_millis(500));

    pool.close().await;
}

#[tokio::test]
async fn registry_create_get_close() {
    let registry = PoolRegistry::new();
    let connector = MockConnector::new();

    let pool = registry
        .create("primary", test_config(1, 2), connector.clone())
        .await
        .expect("create");
    assert_eq!(pool.stats().current_size, 1);

    let err = registry
        .create("primary", test_config(1, 2), connector.clone())
        .await
        .expect_err("duplicate name");
    assert!(matches!(err, PoolError::PoolExists { .. }));

    let looked_up = registry.get("primary").await.expect("registered");
    assert_eq!(looked_up.stats().current_size, 1);
    assert!(registry.get("absent").await.is_none());

    registry.close("primary").await.expect("close");
    assert!(pool.is_closed());
    assert!(registry.get("primary").await.is_none());

    let err = registry.close("primary").await.expect_err("already gone");
    assert!(matches!(err, PoolError::UnknownPool { .. }));
}

#[tokio::test]
async fn registry_close_all_closes_every_pool() {
    let registry = PoolRegistry::new();
    let connector = MockConnector::new();

    let a = registry
        .create("a", test_config(1, 2), connector.clone())
        .await
        .expect("create a");
    let b = registry
        .create("b", test_config(1, 2), connector.clone())
        .await
        .expect("create b");

    assert_eq!(registry.names().await.len(), 2);
    registry.close_all().await;

    assert!(a.is_closed());
    assert!(b.is_closed());
    assert!(registry.names().await.is_empty());
}

#[tokio::test]
async fn failed_registry_creation_registers_nothing() {
    let registry = PoolRegistry::new();
    let connector = MockConnector::new();
    connector.state.fail_connects.store(8, Ordering::SeqCst);

    let err = registry
        .create("broken", test_config(2, 4), connector.clone())
        .await
        .expect_err("construction fails");
    assert!(matches!(err, PoolError::ConnectionCreateFailed { .. }));
    assert!(registry.get("broken").await.is_none());
}
