//! Execution Engine
//!
//! Wraps one agent dispatch with result caching, circuit breaking, a
//! timeout, and bounded retries. Failures never escape as errors: the engine
//! always hands back an [`AgentExecutionResult`], with status FAILED when
//! every attempt failed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::communication::AgentCommunicationBus;
use crate::events::{metric_names, MetricsSink, TracingMetricsSink};
use crate::reliability::{BackoffStrategy, CircuitBreakerError, CircuitBreakerRegistry};
use crate::types::{
    error_codes, AgentExecutionRequest, AgentExecutionResult, AgentRegistration, ErrorSeverity,
    ExecutionError,
};

const ENGINE_SOURCE: &str = "execution-engine";

/// Receives per-agent outcome and load updates from the engine
pub trait AgentMetricsHook: Send + Sync {
    fn record_outcome(&self, agent_id: &str, success: bool, current_load: f64);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay schedule between retries
    pub backoff: BackoffStrategy,

    /// Concurrent executions an agent is assumed to handle; load is in-flight / capacity
    pub agent_capacity: u32,

    /// How long a successful result answers repeats of its request id
    pub cache_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::default(),
            agent_capacity: 4,
            cache_ttl_ms: 600_000,
        }
    }
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

struct CachedResult {
    stored_at: tokio::time::Instant,
    result: AgentExecutionResult,
}

/// Decrements the agent's in-flight count when an attempt ends
struct InFlight<'a> {
    counts: &'a DashMap<String, u32>,
    agent_id: &'a str,
}

impl<'a> InFlight<'a> {
    fn enter(counts: &'a DashMap<String, u32>, agent_id: &'a str) -> Self {
        *counts.entry(agent_id.to_string()).or_insert(0) += 1;
        Self { counts, agent_id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counts.remove_if_mut(self.agent_id, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

pub struct ExecutionEngine {
    config: EngineConfig,
    bus: Arc<AgentCommunicationBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: DashMap<(String, String), CachedResult>,
    in_flight: DashMap<String, u32>,
    metrics_hook: Option<Arc<dyn AgentMetricsHook>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        bus: Arc<AgentCommunicationBus>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            config,
            bus,
            breakers,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
            metrics_hook: None,
            metrics: Arc::new(TracingMetricsSink),
        }
    }

    pub fn with_metrics_hook(mut self, hook: Arc<dyn AgentMetricsHook>) -> Self {
        self.metrics_hook = Some(hook);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub async fn execute_with_agent(
        &self,
        agent: &AgentRegistration,
        request: &AgentExecutionRequest,
    ) -> AgentExecutionResult {
        let key = (agent.agent_id.clone(), request.request_id.clone());
        if let Some(cached) = self.cached(&key) {
            debug!(agent_id = %agent.agent_id, request_id = %request.request_id, "Cache hit");
            self.metrics.increment_counter(metric_names::CACHE_HITS, 1);
            return cached;
        }

        self.metrics.increment_counter(metric_names::EXECUTIONS, 1);
        let started = Instant::now();
        let max_attempts = request.constraints.max_retries.saturating_add(1);
        let mut last_error: Option<ExecutionError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.config.backoff.calculate_delay(attempt - 1);
                debug!(
                    agent_id = %agent.agent_id,
                    request_id = %request.request_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying execution"
                );
                self.metrics
                    .increment_counter(metric_names::EXECUTION_RETRIES, 1);
                tokio::time::sleep(delay).await;
            }

            let outcome = self.attempt(agent, request).await;
            // Breaker rejections never reached the agent
            if !matches!(&outcome, Err(e) if e.code == error_codes::CIRCUIT_OPEN) {
                self.report(&agent.agent_id, outcome.is_ok());
            }

            match outcome {
                Ok(result) => {
                    self.metrics.record_histogram(
                        metric_names::EXECUTION_DURATION_MS,
                        started.elapsed().as_millis() as f64,
                    );
                    self.evict_expired();
                    let stored = self.cache.entry(key).or_insert(CachedResult {
                        stored_at: tokio::time::Instant::now(),
                        result,
                    });
                    return stored.result.clone();
                }
                Err(error) => {
                    warn!(
                        agent_id = %agent.agent_id,
                        request_id = %request.request_id,
                        attempt = attempt + 1,
                        max_attempts,
                        code = %error.code,
                        error = %error.message,
                        "Execution attempt failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        self.metrics
            .increment_counter(metric_names::EXECUTION_FAILURES, 1);
        let terminal = terminal_error(&agent.agent_id, max_attempts, last_error);
        info!(
            agent_id = %agent.agent_id,
            request_id = %request.request_id,
            "Retries exhausted"
        );
        AgentExecutionResult::failure(request.request_id.clone(), agent.agent_id.clone(), terminal)
            .with_execution_time(started.elapsed())
    }

    async fn attempt(
        &self,
        agent: &AgentRegistration,
        request: &AgentExecutionRequest,
    ) -> Result<AgentExecutionResult, ExecutionError> {
        let breaker = self.breakers.get_or_create(&agent.agent_id);
        let _in_flight = InFlight::enter(&self.in_flight, &agent.agent_id);
        let timeout = request.constraints.max_execution_time();

        let guarded = async {
            match tokio::time::timeout(timeout, self.bus.send(agent, request)).await {
                Ok(Ok(result)) if !result.is_failed() => Ok(result),
                Ok(Ok(result)) => Err(reported_failure(&agent.agent_id, &result)),
                Ok(Err(e)) => Err(ExecutionError::new(
                    e.code(),
                    e.to_string(),
                    ErrorSeverity::High,
                    ENGINE_SOURCE,
                )
                .with_context("agent_id", agent.agent_id.clone())),
                Err(_) => {
                    self.metrics
                        .increment_counter(metric_names::EXECUTION_TIMEOUTS, 1);
                    Err(ExecutionError::new(
                        error_codes::TIMEOUT,
                        format!(
                            "Agent {} did not respond within {}ms",
                            agent.agent_id, request.constraints.max_execution_time_ms
                        ),
                        ErrorSeverity::High,
                        ENGINE_SOURCE,
                    )
                    .with_context("agent_id", agent.agent_id.clone()))
                }
            }
        };

        match breaker.call(guarded).await {
            Ok(outcome) => outcome,
            Err(CircuitBreakerError::Open { agent_id }) => {
                self.metrics
                    .increment_counter(metric_names::CIRCUIT_OPEN_REJECTIONS, 1);
                Err(ExecutionError::new(
                    error_codes::CIRCUIT_OPEN,
                    format!("Circuit breaker open for agent {}", agent_id),
                    ErrorSeverity::Medium,
                    ENGINE_SOURCE,
                )
                .with_context("agent_id", agent_id))
            }
            Err(e) => Err(ExecutionError::new(
                error_codes::TRANSPORT_ERROR,
                e.to_string(),
                ErrorSeverity::High,
                ENGINE_SOURCE,
            )),
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<AgentExecutionResult> {
        let ttl = self.config.cache_ttl();
        let hit = self
            .cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.result.clone());
        if hit.is_none() {
            self.cache
                .remove_if(key, |_, entry| entry.stored_at.elapsed() >= ttl);
        }
        hit
    }

    fn evict_expired(&self) {
        let ttl = self.config.cache_ttl();
        self.cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
    }

    fn report(&self, agent_id: &str, success: bool) {
        if let Some(hook) = &self.metrics_hook {
            hook.record_outcome(agent_id, success, self.load(agent_id));
        }
    }

    /// Fraction of the agent's capacity currently in use
    pub fn load(&self, agent_id: &str) -> f64 {
        let capacity = self.config.agent_capacity.max(1) as f64;
        let in_flight = self.in_flight(agent_id) as f64;
        (in_flight / capacity).min(1.0)
    }

    pub fn in_flight(&self, agent_id: &str) -> u32 {
        self.in_flight.get(agent_id).map(|c| *c).unwrap_or(0)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Error for a result the agent itself reported as FAILED
fn reported_failure(agent_id: &str, result: &AgentExecutionResult) -> ExecutionError {
    match result.errors.first() {
        Some(first) => first.clone(),
        None => ExecutionError::new(
            error_codes::AGENT_ERROR,
            format!("Agent {} reported failure", agent_id),
            ErrorSeverity::High,
            agent_id,
        ),
    }
}

fn terminal_error(
    agent_id: &str,
    attempts: u32,
    last_error: Option<ExecutionError>,
) -> ExecutionError {
    let (message, cause_code) = match last_error {
        Some(error) => (error.message, error.code),
        None => (
            "Execution failed".to_string(),
            error_codes::EXECUTION_FAILED.to_string(),
        ),
    };
    ExecutionError::new(
        error_codes::EXECUTION_FAILED,
        message,
        ErrorSeverity::High,
        ENGINE_SOURCE,
    )
    .with_context("agent_id", agent_id)
    .with_context(error_codes::CAUSE_CODE_KEY, cause_code)
    .with_context("attempts", attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::InProcessTransport;
    use crate::reliability::{CircuitBreakerConfig, CircuitBreakerState};
    use crate::registry::AgentRegistry;
    use crate::types::{AgentEndpoint, EndpointType, ExecutionConstraints};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Harness {
        registry: Arc<AgentRegistry>,
        transport: Arc<InProcessTransport>,
        engine: ExecutionEngine,
        agent: AgentRegistration,
    }

    fn harness(threshold: u32) -> Harness {
        let registry = Arc::new(AgentRegistry::default());
        let transport = Arc::new(InProcessTransport::new());
        let bus = Arc::new(
            AgentCommunicationBus::new(registry.clone())
                .with_transport(EndpointType::InProcess, transport.clone()),
        );
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 60_000,
            })
            .expect("valid config"),
        );
        let engine = ExecutionEngine::new(
            EngineConfig {
                backoff: BackoffStrategy::None,
                agent_capacity: 2,
                cache_ttl_ms: 60_000,
            },
            bus,
            breakers,
        )
        .with_metrics_hook(registry.clone());
        let agent = registry
            .register(
                "agent-1",
                "Agent",
                "COMMON_AGENT",
                ["REASONING"],
                AgentEndpoint::in_process("agent-1"),
                "t",
            )
            .expect("valid registration");
        Harness {
            registry,
            transport,
            engine,
            agent,
        }
    }

    fn counting_handler(calls: Arc<AtomicU32>, fail_first: u32) -> Arc<dyn crate::communication::LocalAgent> {
        Arc::new(move |req: AgentExecutionRequest| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    anyhow::bail!("transient failure {}", n);
                }
                Ok(AgentExecutionResult::success(req.request_id, "", json!({"n": n})))
            }
        })
    }

    fn request(retries: u32, timeout_ms: u64) -> AgentExecutionRequest {
        AgentExecutionRequest::new("task")
            .with_request_id("req-1")
            .with_constraints(
                ExecutionConstraints::default()
                    .with_max_retries(retries)
                    .with_timeout_ms(timeout_ms),
            )
    }

    #[tokio::test]
    async fn test_cached_result_is_returned_without_dispatch() {
        let h = harness(5);
        let calls = Arc::new(AtomicU32::new(0));
        h.transport
            .register_handler("agent-1", counting_handler(calls.clone(), 0));

        let first = h.engine.execute_with_agent(&h.agent, &request(0, 1_000)).await;
        let second = h.engine.execute_with_agent(&h.agent, &request(0, 1_000)).await;

        assert!(first.is_success());
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.cache_len(), 1);

        h.engine.clear_cache();
        assert_eq!(h.engine.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = harness(5);
        let calls = Arc::new(AtomicU32::new(0));
        h.transport
            .register_handler("agent-1", counting_handler(calls.clone(), 2));

        let result = h.engine.execute_with_agent(&h.agent, &request(3, 1_000)).await;
        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_produce_failed_result() {
        let h = harness(10);
        let calls = Arc::new(AtomicU32::new(0));
        h.transport
            .register_handler("agent-1", counting_handler(calls.clone(), u32::MAX));

        let result = h.engine.execute_with_agent(&h.agent, &request(2, 1_000)).await;
        assert!(result.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.errors.len(), 1);

        let error = &result.errors[0];
        assert_eq!(error.code, error_codes::EXECUTION_FAILED);
        assert_eq!(error.cause_code(), Some(error_codes::AGENT_ERROR));
        assert_eq!(error.context["agent_id"], "agent-1");
        assert!(error.message.contains("transient failure 2"));
        assert_eq!(h.engine.cache_len(), 0);

        let agent = h.registry.get("agent-1").expect("registered");
        assert!(agent.success_rate().expect("numeric") < 1.0);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let h = harness(5);
        h.transport.register_handler(
            "agent-1",
            Arc::new(|req: AgentExecutionRequest| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>(AgentExecutionResult::success(req.request_id, "", json!(null)))
            }),
        );

        let result = h.engine.execute_with_agent(&h.agent, &request(0, 20)).await;
        assert!(result.is_failed());
        assert_eq!(result.errors[0].cause_code(), Some(error_codes::TIMEOUT));
        assert_eq!(h.engine.in_flight("agent-1"), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_transport() {
        let h = harness(2);
        let calls = Arc::new(AtomicU32::new(0));
        h.transport
            .register_handler("agent-1", counting_handler(calls.clone(), u32::MAX));

        let result = h.engine.execute_with_agent(&h.agent, &request(3, 1_000)).await;
        assert!(result.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.engine.breakers().state("agent-1"),
            Some(CircuitBreakerState::Open)
        );
        assert_eq!(result.errors[0].cause_code(), Some(error_codes::CIRCUIT_OPEN));
    }

    #[tokio::test]
    async fn test_reported_failure_counts_as_failure() {
        let h = harness(5);
        h.transport.register_handler(
            "agent-1",
            Arc::new(|req: AgentExecutionRequest| async move {
                Ok::<_, anyhow::Error>(AgentExecutionResult::failure(
                    req.request_id,
                    "",
                    ExecutionError::new(
                        error_codes::FATAL_ERROR,
                        "corrupt input",
                        ErrorSeverity::Critical,
                        "agent",
                    ),
                ))
            }),
        );

        let result = h.engine.execute_with_agent(&h.agent, &request(1, 1_000)).await;
        assert!(result.is_failed());
        assert_eq!(result.errors[0].cause_code(), Some(error_codes::FATAL_ERROR));
        assert_eq!(result.first_error_message(), Some("corrupt input"));
    }

    #[derive(Default)]
    struct RecordingHook {
        outcomes: parking_lot::Mutex<Vec<bool>>,
    }

    impl AgentMetricsHook for RecordingHook {
        fn record_outcome(&self, _agent_id: &str, success: bool, _current_load: f64) {
            self.outcomes.lock().push(success);
        }
    }

    #[tokio::test]
    async fn test_breaker_rejections_are_not_reported_as_outcomes() {
        let h = harness(2);
        let hook = Arc::new(RecordingHook::default());
        let engine = ExecutionEngine::new(
            EngineConfig {
                backoff: BackoffStrategy::None,
                ..Default::default()
            },
            h.engine.bus.clone(),
            h.engine.breakers.clone(),
        )
        .with_metrics_hook(hook.clone());
        let calls = Arc::new(AtomicU32::new(0));
        h.transport
            .register_handler("agent-1", counting_handler(calls.clone(), u32::MAX));

        let result = engine.execute_with_agent(&h.agent, &request(3, 1_000)).await;
        assert_eq!(result.errors[0].cause_code(), Some(error_codes::CIRCUIT_OPEN));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*hook.outcomes.lock(), vec![false, false]);
    }

    #[tokio::test]
    async fn test_idle_agents_leave_the_in_flight_table() {
        let h = harness(5);
        let calls = Arc::new(AtomicU32::new(0));
        h.transport
            .register_handler("agent-1", counting_handler(calls.clone(), 1));

        let result = h.engine.execute_with_agent(&h.agent, &request(1, 1_000)).await;
        assert!(result.is_success());
        assert_eq!(h.engine.in_flight("agent-1"), 0);
        assert!(h.engine.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_results_expire() {
        let h = harness(5);
        let engine = ExecutionEngine::new(
            EngineConfig {
                backoff: BackoffStrategy::None,
                agent_capacity: 2,
                cache_ttl_ms: 1_000,
            },
            h.engine.bus.clone(),
            h.engine.breakers.clone(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        h.transport
            .register_handler("agent-1", counting_handler(calls.clone(), 0));

        engine.execute_with_agent(&h.agent, &request(0, 500)).await;
        engine
            .execute_with_agent(&h.agent, &request(0, 500).with_request_id("req-2"))
            .await;
        engine.execute_with_agent(&h.agent, &request(0, 500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.cache_len(), 2);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        let again = engine.execute_with_agent(&h.agent, &request(0, 500)).await;
        assert_eq!(again.output, json!({"n": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The expired req-2 entry went with the refresh
        assert_eq!(engine.cache_len(), 1);
    }
}
