//! Circuit Breaker Implementation
//!
//! Per-agent failure isolation. A breaker opens after a run of consecutive
//! failures, rejects calls while open, and lets exactly one trial call through
//! once the reset timeout has passed since the last failure.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker for agent {agent_id} is open - call rejected")]
    Open { agent_id: String },

    #[error("Circuit breaker configuration invalid: {reason}")]
    ConfigurationError { reason: String },
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Calls flow through normally
    Closed,

    /// Calls are rejected
    Open,

    /// One trial call is testing whether the agent recovered
    HalfOpen,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time since the last failure before an open circuit admits a trial call
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::ConfigurationError {
                reason: "failure_threshold must be greater than 0".to_string(),
            });
        }
        if self.reset_timeout_ms == 0 {
            return Err(CircuitBreakerError::ConfigurationError {
                reason: "reset_timeout_ms must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Statistics for circuit breaker operations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_transitions: u64,
    pub failure_count: u32,
    pub current_state: CircuitBreakerState,
}

impl CircuitBreakerStats {
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.rejected_calls as f64 / self.total_calls as f64
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for a single agent
#[derive(Debug)]
pub struct CircuitBreaker {
    agent_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    state_transitions: AtomicU64,
}

/// Records a failure if an admitted call is abandoned before reporting its outcome.
struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl AdmittedCall<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(agent_id = %self.breaker.agent_id, "Admitted call abandoned");
            self.breaker.record_failure();
        }
    }
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Decide whether a call may proceed. Moves OPEN to HALF_OPEN once the
    /// reset timeout has elapsed; only one trial call is admitted while half-open.
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();

        let admitted = match inner.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                let reset_elapsed = inner
                    .last_failure_time
                    .map(|at| at.elapsed() >= self.config.reset_timeout())
                    .unwrap_or(true);
                if reset_elapsed {
                    self.transition(&mut inner, CircuitBreakerState::HalfOpen);
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        };

        if admitted {
            Ok(())
        } else {
            self.rejected_calls.fetch_add(1, Ordering::SeqCst);
            debug!(agent_id = %self.agent_id, state = %inner.state, "Call rejected by circuit breaker");
            Err(CircuitBreakerError::Open {
                agent_id: self.agent_id.clone(),
            })
        }
    }

    /// Record successful operation
    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count = 0;
            }
            CircuitBreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.failure_count = 0;
                self.transition(&mut inner, CircuitBreakerState::Closed);
            }
            CircuitBreakerState::Open => {
                warn!(agent_id = %self.agent_id, "Recorded success while circuit is open");
            }
        }
    }

    /// Record failed operation
    pub fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitBreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.failure_count += 1;
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    /// Run `operation` under the breaker. The outer error means the call was
    /// rejected without running; the inner result is the operation's own.
    pub async fn call<T, E, Fut>(&self, operation: Fut) -> Result<Result<T, E>, CircuitBreakerError>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;
        let admitted = AdmittedCall {
            breaker: self,
            settled: false,
        };
        let outcome = operation.await;
        admitted.settle(outcome.is_ok());
        Ok(outcome)
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Back to CLOSED with a clean failure count
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitBreakerState::Closed);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            total_calls: self.total_calls.load(Ordering::SeqCst),
            successful_calls: self.successful_calls.load(Ordering::SeqCst),
            failed_calls: self.failed_calls.load(Ordering::SeqCst),
            rejected_calls: self.rejected_calls.load(Ordering::SeqCst),
            state_transitions: self.state_transitions.load(Ordering::SeqCst),
            failure_count: inner.failure_count,
            current_state: inner.state,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn transition(&self, inner: &mut BreakerState, next: CircuitBreakerState) {
        if inner.state == next {
            return;
        }
        match next {
            CircuitBreakerState::Open => warn!(
                agent_id = %self.agent_id,
                failures = inner.failure_count,
                "Circuit breaker opening - blocking calls"
            ),
            CircuitBreakerState::HalfOpen => info!(
                agent_id = %self.agent_id,
                "Circuit breaker transitioning to half-open - testing recovery"
            ),
            CircuitBreakerState::Closed => info!(
                agent_id = %self.agent_id,
                "Circuit breaker closing - agent recovered"
            ),
        }
        inner.state = next;
        self.state_transitions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Lazily creates and caches one breaker per agent id
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            breakers: DashMap::new(),
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        Ok(Self {
            config,
            breakers: DashMap::new(),
        })
    }

    pub fn get_or_create(&self, agent_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(agent_id) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                debug!(agent_id, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(agent_id, self.config.clone()))
            });
        Arc::clone(breaker.value())
    }

    pub fn state(&self, agent_id: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(agent_id).map(|b| b.state())
    }

    pub fn states(&self) -> HashMap<String, CircuitBreakerState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    pub fn stats(&self, agent_id: &str) -> Option<CircuitBreakerStats> {
        self.breakers.get(agent_id).map(|b| b.stats())
    }

    /// Returns false when no breaker exists for the agent
    pub fn reset(&self, agent_id: &str) -> bool {
        match self.breakers.get(agent_id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "agent-1",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = breaker(5, 60_000);
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_opens_on_threshold() {
        let cb = breaker(5, 60_000);
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitBreakerState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert_eq!(
            cb.try_acquire(),
            Err(CircuitBreakerError::Open {
                agent_id: "agent-1".to_string()
            })
        );
    }

    #[test]
    fn test_success_in_closed_resets_failure_count() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = breaker(2, 20);
        cb.record_failure();
        cb.record_failure();
        thread::sleep(Duration::from_millis(30));

        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitBreakerState::HalfOpen);
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_trial_success_closes() {
        let cb = breaker(2, 10);
        cb.record_failure();
        cb.record_failure();
        thread::sleep(Duration::from_millis(20));

        assert!(cb.try_acquire().is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitBreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_trial_failure_reopens() {
        let cb = breaker(2, 10);
        cb.record_failure();
        cb.record_failure();
        thread::sleep(Duration::from_millis(20));

        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitBreakerState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_call_skips_operation_when_open() {
        let cb = breaker(1, 60_000);
        let first: Result<Result<(), &str>, _> = cb.call(async { Err("boom") }).await;
        assert_eq!(first, Ok(Err("boom")));
        assert_eq!(cb.state(), CircuitBreakerState::Open);

        let mut invoked = false;
        let second = cb
            .call(async {
                invoked = true;
                Ok::<_, &str>(())
            })
            .await;
        assert!(second.is_err());
        assert!(!invoked);
    }

    #[test]
    fn test_circuit_breaker_stats() {
        let cb = breaker(1, 60_000);
        assert!(cb.try_acquire().is_ok());
        cb.record_failure();
        assert!(cb.try_acquire().is_err());

        let stats = cb.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.rejected_calls, 1);
        assert_eq!(stats.state_transitions, 1);
        assert_eq!(stats.current_state, CircuitBreakerState::Open);
        assert!((stats.rejection_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_registry_caches_and_resets() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 60_000,
        })
        .expect("valid config");

        let a = registry.get_or_create("agent-a");
        let again = registry.get_or_create("agent-a");
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(registry.len(), 1);

        a.record_failure();
        assert_eq!(registry.state("agent-a"), Some(CircuitBreakerState::Open));
        assert!(registry.reset("agent-a"));
        assert_eq!(registry.state("agent-a"), Some(CircuitBreakerState::Closed));
        assert!(!registry.reset("agent-missing"));
        assert_eq!(registry.states().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 0,
            reset_timeout_ms: 1,
        });
        assert!(matches!(
            result,
            Err(CircuitBreakerError::ConfigurationError { .. })
        ));
    }
}
