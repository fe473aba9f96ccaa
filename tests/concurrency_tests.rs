//! Concurrency behavior of the resilience primitives under contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pg_gateway::resilience::{CircuitBreaker, CircuitState, MultiRateLimiter, RateLimiter};

/// With N slots and many contenders, the observed in-flight high-water mark
/// never exceeds N and every contender eventually runs.
#[tokio::test]
async fn limiter_bounds_concurrent_work() {
    const SLOTS: usize = 4;
    const TASKS: usize = 32;

    let limiter = Arc::new(RateLimiter::new("test", SLOTS));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let limiter = Arc::clone(&limiter);
        let in_flight = Arc::clone(&in_flight);
        let high_water = Arc::clone(&high_water);
        let completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            let _slot = limiter.acquire(None).await.unwrap();
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), TASKS);
    assert!(high_water.load(Ordering::SeqCst) <= SLOTS);
    assert_eq!(limiter.active_count(), 0);
    assert_eq!(limiter.snapshot().total_requests, TASKS as u64);
    assert_eq!(limiter.snapshot().total_rejections, 0);
}

/// Bounded acquires against a saturated limiter reject instead of queueing
/// forever, and the rejection count matches.
#[tokio::test]
async fn saturated_limiter_rejects_bounded_waiters() {
    let limiter = Arc::new(RateLimiter::new("test", 2));
    let _a = limiter.acquire(None).await.unwrap();
    let _b = limiter.acquire(None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.acquire(Some(Duration::from_millis(20))).await
        }));
    }

    let mut rejections = 0;
    for handle in handles {
        if handle.await.unwrap().is_err() {
            rejections += 1;
        }
    }
    assert_eq!(rejections, 5);
    assert_eq!(limiter.snapshot().total_rejections, 5);
    // The held slots were untouched by the failed waiters.
    assert_eq!(limiter.active_count(), 2);
}

/// Exhausting the query limiter leaves the LLM limiter fully available.
#[tokio::test]
async fn limiter_classes_do_not_interfere() {
    let multi = Arc::new(MultiRateLimiter::new(1, 8));
    let _query = multi.acquire_query_slot(None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let multi = Arc::clone(&multi);
        handles.push(tokio::spawn(async move {
            multi
                .acquire_llm_slot(Some(Duration::from_millis(50)))
                .await
                .map(|guard| {
                    drop(guard);
                })
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}

/// Racing callers against a half-open breaker admit exactly one probe.
#[test]
fn half_open_probe_is_single_admission_across_threads() {
    let breaker = Arc::new(CircuitBreaker::new("llm", 1, Duration::from_millis(10)));
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    std::thread::sleep(Duration::from_millis(20));

    let admitted = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let breaker = Arc::clone(&breaker);
        let admitted = Arc::clone(&admitted);
        handles.push(std::thread::spawn(move || {
            if breaker.allow_request() {
                admitted.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // The probe outcome decides for everyone.
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.allow_request());
}

/// Concurrent failure recording trips the breaker exactly once it crosses
/// the threshold, never below it.
#[test]
fn breaker_threshold_holds_under_concurrent_failures() {
    let breaker = Arc::new(CircuitBreaker::new("llm", 8, Duration::from_secs(60)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let breaker = Arc::clone(&breaker);
        handles.push(std::thread::spawn(move || breaker.record_failure()));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(breaker.failure_count(), 8);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allow_request());
}
