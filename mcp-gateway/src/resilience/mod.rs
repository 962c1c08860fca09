//! Resilience primitives protecting upstream calls
//!
//! Each upstream call is wrapped in a pipeline of independent layers:
//! timeout (the effective deadline), retry (transient errors only), and
//! the per-tool circuit breaker. The layers have pure interfaces and are
//! tested in isolation.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerSnapshot, CallPermit, CircuitBreaker, CircuitStateKind};
pub use retry::{retry_with_backoff, RetryPolicy};
