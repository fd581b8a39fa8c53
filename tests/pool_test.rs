//! Pool capacity and fairness tests against an in-memory connector.

use query_gateway::db::{Backoff, ConnectionPool, Connector, PoolSettings};
use query_gateway::error::{DbError, DbResult};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct MemoryConnector {
    next: AtomicU64,
    flaky: AtomicBool,
}

impl Connector for MemoryConnector {
    type Connection = u64;

    async fn connect(&self) -> DbResult<u64> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if self.flaky.load(Ordering::Relaxed) && rand::thread_rng().gen_bool(0.2) {
            return Err(DbError::connectivity("flaky network", "retry"));
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    async fn ping(&self, _conn: &mut u64) -> DbResult<()> {
        Ok(())
    }

    async fn close(&self, _conn: u64) {}
}

fn settings(min: u32, max: u32, acquire_timeout: Duration) -> PoolSettings {
    PoolSettings {
        min_connections: min,
        max_connections: max,
        acquire_timeout,
        connect_timeout: Duration::from_millis(500),
        backoff: Backoff {
            initial: Duration::from_millis(2),
            max: Duration::from_millis(10),
            multiplier: 2.0,
        },
        ..PoolSettings::default()
    }
}

#[tokio::test]
async fn test_third_acquire_waits_for_release() {
    let pool = ConnectionPool::new(
        "main",
        MemoryConnector::default(),
        settings(0, 2, Duration::from_secs(5)),
    );

    let first = tokio::time::timeout(Duration::from_millis(200), pool.acquire())
        .await
        .expect("first acquire is immediate")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_millis(200), pool.acquire())
        .await
        .expect("second acquire is immediate")
        .unwrap();
    assert_eq!(pool.stats().busy, 2);

    let third = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!third.is_finished(), "third acquire must wait while two are busy");

    let released_id = *first;
    first.release().await;

    let third = tokio::time::timeout(Duration::from_secs(1), third)
        .await
        .expect("third acquire completes after a release")
        .unwrap()
        .unwrap();
    assert_eq!(*third, released_id);

    let stats = pool.stats();
    assert_eq!(stats.busy, 2);
    assert!(stats.live() <= 2);
    assert_eq!(stats.total_created, 2);

    second.release().await;
    third.release().await;
    assert_eq!(pool.stats().busy, 0);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let pool = ConnectionPool::new(
        "main",
        MemoryConnector::default(),
        settings(0, 1, Duration::from_millis(50)),
    );
    let held = pool.acquire().await.unwrap();

    let err = tokio_test::assert_err!(pool.acquire().await);
    assert_eq!(err.code(), "POOL_EXHAUSTED");
    assert!(err.is_retryable());

    held.release().await;
    tokio_test::assert_ok!(pool.acquire().await).release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_invariant_under_concurrent_fuzz() {
    const MAX: u32 = 4;
    let connector = MemoryConnector::default();
    connector.flaky.store(true, Ordering::Relaxed);
    let pool = ConnectionPool::new("fuzz", connector, settings(1, MAX, Duration::from_millis(200)));
    pool.warm_up().await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let pool = pool.clone();
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut samples = 0u64;
            while !done.load(Ordering::Relaxed) {
                let stats = pool.stats();
                assert!(
                    stats.busy + stats.idle <= MAX,
                    "busy {} + idle {} exceeds max {MAX}",
                    stats.busy,
                    stats.idle
                );
                assert!(stats.live() <= MAX, "live connections exceed max: {stats:?}");
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        })
    };

    let mut workers = Vec::new();
    for _ in 0..32 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..25 {
                let (hold_ms, poison, drop_guard) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(0..4), rng.gen_bool(0.1), rng.gen_bool(0.2))
                };
                let Ok(mut conn) = pool.acquire().await else {
                    continue;
                };
                tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                if poison {
                    conn.mark_unusable();
                }
                if drop_guard {
                    drop(conn);
                } else {
                    conn.release().await;
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    done.store(true, Ordering::Relaxed);
    let samples = sampler.await.unwrap();
    assert!(samples > 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = pool.stats();
    assert_eq!(stats.busy, 0);
    assert!(stats.idle <= MAX);
}
