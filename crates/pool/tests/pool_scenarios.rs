use portal_config::PoolConfig;
use portal_errors::{WorkerError, WorkerResult};
use portal_pool::{HandleFactory, ResourcePool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

struct Connector {
    next_id: AtomicUsize,
}

impl HandleFactory for Connector {
    type Handle = usize;

    fn create(&self) -> WorkerResult<usize> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

fn build_pool(pool_size: usize, max_overflow: usize) -> ResourcePool<Connector> {
    let config = PoolConfig {
        pool_size,
        max_overflow,
        acquire_timeout_seconds: 2,
        retry_delay_ms: 1,
        ..PoolConfig::default()
    };
    ResourcePool::new(
        "scenario",
        Connector {
            next_id: AtomicUsize::new(0),
        },
        config,
    )
    .unwrap()
}

#[test]
fn test_overflow_limit_then_exhausted() {
    let pool = build_pool(2, 1);
    let barrier = Arc::new(Barrier::new(4));

    let holders: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let handle = pool.acquire(Duration::from_secs(1)).unwrap();
                barrier.wait(); // 三个连接同时被持有
                barrier.wait(); // 等待第四次获取结束
                drop(handle);
            })
        })
        .collect();

    barrier.wait();
    assert_eq!(pool.stats().checked_out, 3);

    let started = Instant::now();
    let err = pool.acquire(Duration::ZERO).unwrap_err();
    assert!(matches!(
        err,
        WorkerError::PoolExhausted {
            checked_out: 3,
            limit: 3,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_millis(500));
    barrier.wait();

    for holder in holders {
        holder.join().unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.idle, 2);
}

#[test]
fn test_exhausted_after_timeout_not_hang() {
    let pool = build_pool(1, 0);
    let _held = pool.acquire(Duration::ZERO).unwrap();

    let started = Instant::now();
    let err = pool.acquire(Duration::from_millis(200)).unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, WorkerError::PoolExhausted { .. }));
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(2));
}

#[test]
fn test_checked_out_never_exceeds_limit_under_contention() {
    let pool = build_pool(2, 2);
    let peak = Arc::new(AtomicUsize::new(0));
    let in_use = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            let in_use = Arc::clone(&in_use);
            thread::spawn(move || {
                for _ in 0..25 {
                    if let Ok(handle) = pool.acquire(Duration::from_millis(50)) {
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(pool.stats().checked_out <= 4);
                        thread::sleep(Duration::from_millis(1));
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        drop(handle);
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    let stats = pool.stats();
    assert_eq!(stats.checked_out, 0);
    assert!(stats.idle <= 2);
}

#[test]
fn test_with_retry_returns_last_error_unchanged() {
    let pool = build_pool(1, 0);
    let attempts = AtomicUsize::new(0);

    let result: WorkerResult<()> = pool.with_retry(
        |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Err(WorkerError::timeout(format!("attempt {n}")))
        },
        2,
    );

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match result {
        Err(WorkerError::Timeout(msg)) => assert_eq!(msg, "attempt 2"),
        other => panic!("unexpected result: {other:?}"),
    }
}
