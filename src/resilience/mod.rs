//! Failure isolation primitives: circuit breaking for the LLM edge and
//! concurrency limiting for both the LLM and database edges.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use rate_limiter::{
    MultiRateLimiter, MultiRateLimiterSnapshot, RateLimiter, RateLimiterSnapshot, SlotGuard,
};
