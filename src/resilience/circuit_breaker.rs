//! Circuit breaker guarding the LLM provider edge.
//!
//! Repeated provider failures trip the breaker so further requests fail fast
//! instead of queueing behind a dead upstream. Recovery is probed with a
//! single request after a cooldown. State transitions happen lazily on reads
//! under the lock, so no background timer is needed.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests flow through.
    Closed,
    /// Tripped, requests are rejected until the recovery timeout elapses.
    Open,
    /// Cooldown elapsed, a single probe request is admitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    /// Set once the half-open probe has been admitted; cleared when its
    /// outcome is recorded. Guarantees exactly one in-flight probe.
    probe_admitted: bool,
}

/// Serializable point-in-time view for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

/// A failure-counting circuit breaker.
///
/// All methods are callable concurrently; a single mutex serializes state.
/// Time-based transitions (`Open` -> `HalfOpen`) are evaluated on every
/// state read rather than by a timer.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// `failure_threshold` is the number of consecutive failures that trips
    /// the breaker; `recovery_timeout` is how long it stays open before
    /// admitting a probe. A zero threshold would trip on every read;
    /// `Config::validate` refuses such configurations before a breaker is
    /// ever built.
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        debug_assert!(failure_threshold >= 1, "failure threshold must be >= 1");
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                probe_admitted: false,
            }),
        }
    }

    /// Applies the lazy `Open` -> `HalfOpen` transition if the cooldown
    /// has elapsed. Must be called with the lock held.
    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.recovery_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.probe_admitted = false;
                tracing::info!(
                    breaker = %self.name,
                    "circuit breaker entering half-open state, admitting probe"
                );
            }
        }
    }

    /// Whether a request may proceed right now.
    ///
    /// In `HalfOpen`, returns `true` for exactly one caller; everyone else
    /// is rejected until that probe's outcome is recorded.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_admitted {
                    false
                } else {
                    inner.probe_admitted = true;
                    true
                }
            }
        }
    }

    /// Records a successful call, closing the breaker from `HalfOpen` and
    /// clearing the failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(breaker = %self.name, "probe succeeded, closing circuit breaker");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.probe_admitted = false;
    }

    /// Records a failed call. Trips the breaker when the threshold is
    /// reached, and reopens immediately on a failed half-open probe.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.probe_admitted = false;
                tracing::warn!(
                    breaker = %self.name,
                    "probe failed, reopening circuit breaker"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "failure threshold reached, opening circuit breaker"
                );
            }
            _ => {}
        }
    }

    /// Current state, after applying any due lazy transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Forces the breaker back to `Closed` with a zero count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.probe_admitted = false;
        tracing::info!(breaker = %self.name, "circuit breaker reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }
}
