//! Concurrency limiting for the database- and LLM-facing edges.
//!
//! Each [`RateLimiter`] bounds in-flight work with a semaphore and hands out
//! RAII guards, so a slot is released even when the holder errors or panics.
//! Counters are best-effort atomics read by the stats endpoint; the
//! semaphore alone decides admission.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{GatewayError, GatewayResult};

/// An acquired concurrency slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time counters for one limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub max_concurrent: usize,
    pub active_count: usize,
    pub available_slots: usize,
    pub total_requests: u64,
    pub total_rejections: u64,
}

/// Semaphore-backed concurrency limiter for one resource class.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    total_requests: AtomicU64,
    total_rejections: AtomicU64,
}

impl RateLimiter {
    /// A zero capacity would reject every acquisition; `Config::validate`
    /// refuses such configurations before a limiter is ever built.
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        debug_assert!(max_concurrent >= 1, "rate limiter capacity must be >= 1");
        Self {
            name: name.into(),
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active: Arc::new(AtomicUsize::new(0)),
            total_requests: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Acquires a slot, waiting if all are taken.
    ///
    /// With a `timeout`, waiting is bounded and expiry yields a
    /// `rate_limit_exceeded` error naming the resource. `total_requests`
    /// counts every attempt including rejected ones, and this method is the
    /// only place it is incremented.
    pub async fn acquire(&self, timeout: Option<Duration>) -> GatewayResult<SlotGuard> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(result) => result,
                Err(_) => {
                    self.total_rejections.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        limiter = %self.name,
                        max_concurrent = self.max_concurrent,
                        timeout_ms = limit.as_millis() as u64,
                        "no slot became available before the acquire timeout"
                    );
                    return Err(GatewayError::rate_limit_exceeded(self.name.clone()));
                }
            },
            None => acquire.await,
        };

        // The semaphore is never closed, so this only fails on misuse.
        let permit = permit
            .map_err(|_| GatewayError::internal_error(format!("{} limiter closed", self.name)))?;

        self.active.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            limiter = %self.name,
            active = self.active.load(Ordering::Relaxed),
            "slot acquired"
        );

        Ok(SlotGuard {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Slots currently held. Best-effort gauge, may briefly lag the
    /// semaphore during concurrent acquire/release.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            max_concurrent: self.max_concurrent,
            active_count: self.active.load(Ordering::Relaxed),
            available_slots: self.semaphore.available_permits(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the cumulative counters. Slot accounting (the semaphore and
    /// the active gauge) is untouched, so held guards stay valid.
    pub fn reset_stats(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_rejections.store(0, Ordering::Relaxed);
    }
}

/// Combined snapshot of both limiters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MultiRateLimiterSnapshot {
    pub query: RateLimiterSnapshot,
    pub llm: RateLimiterSnapshot,
}

/// The two independent limiters the orchestrator composes: database query
/// slots and LLM call slots. Exhausting one never blocks the other.
#[derive(Debug)]
pub struct MultiRateLimiter {
    query: RateLimiter,
    llm: RateLimiter,
}

impl MultiRateLimiter {
    pub fn new(max_concurrent_queries: usize, max_concurrent_llm_calls: usize) -> Self {
        Self {
            query: RateLimiter::new("query", max_concurrent_queries),
            llm: RateLimiter::new("llm", max_concurrent_llm_calls),
        }
    }

    pub async fn acquire_query_slot(&self, timeout: Option<Duration>) -> GatewayResult<SlotGuard> {
        self.query.acquire(timeout).await
    }

    pub async fn acquire_llm_slot(&self, timeout: Option<Duration>) -> GatewayResult<SlotGuard> {
        self.llm.acquire(timeout).await
    }

    pub fn query_limiter(&self) -> &RateLimiter {
        &self.query
    }

    pub fn llm_limiter(&self) -> &RateLimiter {
        &self.llm
    }

    pub fn snapshot(&self) -> MultiRateLimiterSnapshot {
        MultiRateLimiterSnapshot {
            query: self.query.snapshot(),
            llm: self.llm.snapshot(),
        }
    }

    /// Zeroes the cumulative counters of both limiters.
    pub fn reset_all_stats(&self) {
        self.query.reset_stats();
        self.llm.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    #[should_panic(expected = "rate limiter capacity must be >= 1")]
    fn zero_capacity_is_a_construction_bug() {
        let _ = RateLimiter::new("test", 0);
    }

    #[tokio::test]
    async fn acquire_and_release_updates_gauge() {
        let limiter = RateLimiter::new("test", 2);
        let guard = limiter.acquire(None).await.unwrap();
        assert_eq!(limiter.active_count(), 1);

        let second = limiter.acquire(None).await.unwrap();
        assert_eq!(limiter.active_count(), 2);

        drop(guard);
        drop(second);
        assert_eq!(limiter.active_count(), 0);
        assert_eq!(limiter.snapshot().available_slots, 2);
    }

    #[tokio::test]
    async fn timed_out_acquire_is_rejected() {
        let limiter = RateLimiter::new("test", 1);
        let _held = limiter.acquire(None).await.unwrap();

        let err = limiter
            .acquire(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert_eq!(err.details["resource"], "test");

        let stats = limiter.snapshot();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_rejections, 1);
        assert_eq!(stats.active_count, 1);
    }

    #[tokio::test]
    async fn released_slot_admits_a_waiter() {
        let limiter = Arc::new(RateLimiter::new("test", 1));
        let guard = limiter.acquire(None).await.unwrap();

        let holder = Arc::clone(&limiter);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
            drop(holder);
        });

        // Unbounded wait succeeds once the holder releases.
        let reacquired = limiter.acquire(None).await.unwrap();
        drop(reacquired);
        assert_eq!(limiter.snapshot().total_rejections, 0);
    }

    #[tokio::test]
    async fn guard_drop_releases_even_after_rejections() {
        let limiter = RateLimiter::new("test", 1);
        let guard = limiter.acquire(None).await.unwrap();
        let _ = limiter.acquire(Some(Duration::from_millis(5))).await;
        drop(guard);

        // The rejected attempt must not have consumed the slot.
        let guard = limiter.acquire(Some(Duration::from_millis(5))).await;
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn limiters_are_independent() {
        let multi = MultiRateLimiter::new(1, 1);
        let _query_slot = multi.acquire_query_slot(None).await.unwrap();

        // Query slots are exhausted; LLM slots are unaffected.
        let llm_slot = multi.acquire_llm_slot(Some(Duration::from_millis(10))).await;
        assert!(llm_slot.is_ok());

        let err = multi
            .acquire_query_slot(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        assert_eq!(err.details["resource"], "query");
    }

    #[tokio::test]
    async fn reset_stats_keeps_slot_accounting() {
        let limiter = RateLimiter::new("test", 1);
        let held = limiter.acquire(None).await.unwrap();
        let _ = limiter.acquire(Some(Duration::from_millis(5))).await;

        limiter.reset_stats();
        let snap = limiter.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.total_rejections, 0);
        // The held slot is still accounted for.
        assert_eq!(snap.active_count, 1);
        assert_eq!(snap.available_slots, 0);
        drop(held);
        assert_eq!(limiter.snapshot().available_slots, 1);
    }

    #[tokio::test]
    async fn reset_all_stats_covers_both_limiters() {
        let multi = MultiRateLimiter::new(1, 1);
        drop(multi.acquire_query_slot(None).await.unwrap());
        drop(multi.acquire_llm_slot(None).await.unwrap());
        assert_eq!(multi.snapshot().query.total_requests, 1);

        multi.reset_all_stats();
        let snap = multi.snapshot();
        assert_eq!(snap.query.total_requests, 0);
        assert_eq!(snap.llm.total_requests, 0);
    }

    #[tokio::test]
    async fn snapshot_reports_both_limiters() {
        let multi = MultiRateLimiter::new(10, 5);
        let snap = multi.snapshot();
        assert_eq!(snap.query.max_concurrent, 10);
        assert_eq!(snap.llm.max_concurrent, 5);
        assert_eq!(snap.query.total_requests, 0);
    }
}
