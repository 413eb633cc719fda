//! End-to-end pool behavior against an in-memory connection manager

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use respool::pool::{
    ConnectError, ConnectionManager, Pool, PoolError, PoolSettings, SupervisorSignal,
};

/// Hands out sequence numbers as connections; can be told to fail
/// validation or to respond slowly
#[derive(Default)]
struct MockManager {
    connects: AtomicU64,
    fail_checks: AtomicBool,
    connect_delay: Duration,
    check_delay: Duration,
}

#[async_trait]
impl ConnectionManager for MockManager {
    type Connection = u64;

    async fn connect(&self) -> Result<u64, ConnectError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn check(&self, _conn: &mut u64) -> Result<(), ConnectError> {
        if !self.check_delay.is_zero() {
            tokio::time::sleep(self.check_delay).await;
        }
        if self.fail_checks.load(Ordering::SeqCst) {
            Err(ConnectError::Refused("validation failed".to_string()))
        } else {
            Ok(())
        }
    }
}

fn settings(max_size: usize) -> PoolSettings {
    PoolSettings {
        max_size,
        // Long enough that background housekeeping never runs mid-test.
        reap_interval: Duration::from_secs(3600),
        ..PoolSettings::default()
    }
}

fn pool(max_size: usize) -> (Pool<MockManager>, mpsc::UnboundedReceiver<SupervisorSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Pool::new(MockManager::default(), settings(max_size), tx), rx)
}

#[tokio::test]
async fn acquire_beyond_bound_times_out_until_release() {
    let (pool, _signals) = pool(2);

    let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let _b = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout(_)));
    assert_eq!(pool.stats().in_use, 2);

    drop(a);
    let c = pool.acquire(Duration::from_millis(200)).await.unwrap();
    assert_eq!(pool.stats().in_use, 2);
    drop(c);
}

#[tokio::test]
async fn released_connection_is_reused_first() {
    let (pool, _signals) = pool(4);

    let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let id = first.id();
    drop(first);

    let second = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(second.id(), id);

    let stats = pool.stats();
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_reused, 1);
}

#[tokio::test]
async fn idle_connections_are_reclaimed_after_timeout() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let pool = Pool::new(
        MockManager::default(),
        PoolSettings {
            max_size: 4,
            idle_timeout: Duration::from_millis(10),
            reap_interval: Duration::from_secs(3600),
            ..PoolSettings::default()
        },
        tx,
    );

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    drop(conn);
    assert_eq!(pool.stats().idle, 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.reap_now().await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.total_reclaimed, 1);
}

#[tokio::test]
async fn validation_pass_holds_the_pool_bound() {
    let (tx, _signals) = mpsc::unbounded_channel();
    let manager = MockManager {
        check_delay: Duration::from_millis(200),
        ..MockManager::default()
    };
    let pool = std::sync::Arc::new(Pool::new(manager, settings(1), tx));

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    drop(conn);
    assert_eq!(pool.stats().idle, 1);

    let reaper = {
        let pool = std::sync::Arc::clone(&pool);
        tokio::spawn(async move { pool.reap_now().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Mid-validation, the one connection is out of the idle set; this
    // acquire must wait for its verdict rather than open a second one.
    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.live, 1, "bound of 1 must hold through housekeeping");
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_reused, 1);

    drop(conn);
    reaper.await.unwrap();
}

#[tokio::test]
async fn slow_connect_fails_under_connect_timeout() {
    let (tx, _signals) = mpsc::unbounded_channel();
    let manager = MockManager {
        connect_delay: Duration::from_millis(200),
        ..MockManager::default()
    };
    let pool = Pool::new(
        manager,
        PoolSettings {
            max_size: 1,
            connect_timeout: Duration::from_millis(20),
            reap_interval: Duration::from_secs(3600),
            ..PoolSettings::default()
        },
        tx,
    );

    // The caller's timeout covers the capacity wait; the connect phase is
    // bounded separately by connect_timeout.
    let started = std::time::Instant::now();
    let err = pool.acquire(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, PoolError::Connect(ConnectError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn timed_out_waiter_leaves_no_reservation() {
    let (pool, _signals) = pool(1);

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    // This waiter gives up; its queue slot must not linger.
    let err = pool.acquire(Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout(_)));

    drop(held);
    pool.acquire(Duration::from_millis(100))
        .await
        .expect("slot freed by the timed-out waiter");
}

#[tokio::test]
async fn failed_idle_validation_escalates_to_supervisor() {
    let manager = MockManager::default();
    manager.fail_checks.store(true, Ordering::SeqCst);
    let (tx, mut signals) = mpsc::unbounded_channel();
    let pool = Pool::new(manager, settings(4), tx);

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    drop(conn);

    pool.reap_now().await;

    match signals.try_recv() {
        Ok(SupervisorSignal::PoolFatal { detail }) => {
            assert!(detail.contains("validation failed"));
        }
        other => panic!("expected PoolFatal, got {:?}", other),
    }
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test]
async fn shutdown_rejects_new_acquisitions() {
    let (pool, _signals) = pool(2);

    let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
    drop(conn);

    pool.shutdown(Duration::from_millis(100)).await;

    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, PoolError::Closed));
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn shutdown_waits_for_inflight_connections() {
    let (pool, _signals) = pool(1);
    let pool = std::sync::Arc::new(pool);

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let holder = {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        })
    };

    // Drain window longer than the hold; shutdown should complete cleanly.
    pool.shutdown(Duration::from_secs(1)).await;
    holder.await.unwrap();
    assert_eq!(pool.stats().live, 0);
}
