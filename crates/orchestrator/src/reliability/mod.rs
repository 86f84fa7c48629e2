//! Agent Reliability Module
//!
//! Per-agent circuit breaking and the backoff schedules used between
//! execution retries.

pub mod circuit_breaker;
pub mod retry_policy;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitBreakerStats,
};
pub use retry_policy::BackoffStrategy;
