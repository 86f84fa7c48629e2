//! Shared fixtures for the integration tests

#![allow(dead_code)]

use agent_orchestrator::events::InMemoryMetricsSink;
use agent_orchestrator::planner::capabilities_for_agent_type;
use agent_orchestrator::{
    AgentCommunicationBus, AgentEndpoint, AgentExecutionRequest, AgentExecutionResult,
    AgentRegistry, EndpointType, ExecutionConstraints, InProcessTransport,
    OrchestrationConfig, Orchestrator,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Log output for a test run with `TEST_LOG=1`
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        if std::env::var("TEST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter("agent_orchestrator=debug")
                .with_test_writer()
                .try_init();
        }
    });
}

pub struct Fixture {
    pub registry: Arc<AgentRegistry>,
    pub transport: Arc<InProcessTransport>,
    pub bus: Arc<AgentCommunicationBus>,
    pub metrics: Arc<InMemoryMetricsSink>,
    pub orchestrator: Orchestrator,
}

impl Fixture {
    pub fn new(config: OrchestrationConfig) -> Self {
        init_test_tracing();
        let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
        let transport = Arc::new(InProcessTransport::new());
        let bus = Arc::new(
            AgentCommunicationBus::new(registry.clone())
                .with_transport(EndpointType::InProcess, transport.clone()),
        );
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let orchestrator = Orchestrator::from_config(
            &config,
            registry.clone(),
            bus.clone(),
            agent_orchestrator::Planner::new(),
        )
        .expect("valid configuration")
        .with_metrics(metrics.clone());

        Self {
            registry,
            transport,
            bus,
            metrics,
            orchestrator,
        }
    }

    fn register(&self, agent_id: &str, agent_type: &str) {
        self.registry
            .register(
                agent_id,
                agent_id,
                agent_type,
                capabilities_for_agent_type(agent_type),
                AgentEndpoint::in_process(agent_id),
                "tenant-1",
            )
            .expect("valid registration");
    }

    /// An agent that answers every task with `output`, approving votes
    pub fn agent(&self, agent_id: &str, agent_type: &str, output: Value) -> Arc<AtomicUsize> {
        self.register(agent_id, agent_type);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = agent_id.to_string();
        self.transport.register_handler(
            agent_id,
            Arc::new(move |req: AgentExecutionRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                let id = id.clone();
                let output = if is_vote(&req) {
                    serde_json::json!({ "approve": true })
                } else {
                    output.clone()
                };
                async move {
                    Ok::<_, anyhow::Error>(
                        AgentExecutionResult::success(req.request_id, id, output)
                            .with_action(format!("handled {}", req.step_id.unwrap_or_default())),
                    )
                }
            }),
        );
        calls
    }

    /// An agent whose answers come from `respond`
    pub fn agent_with<F>(&self, agent_id: &str, agent_type: &str, respond: F)
    where
        F: Fn(&AgentExecutionRequest) -> Value + Send + Sync + 'static,
    {
        self.register(agent_id, agent_type);
        let id = agent_id.to_string();
        self.transport.register_handler(
            agent_id,
            Arc::new(move |req: AgentExecutionRequest| {
                let id = id.clone();
                let output = respond(&req);
                async move {
                    Ok::<_, anyhow::Error>(AgentExecutionResult::success(req.request_id, id, output))
                }
            }),
        );
    }

    /// An agent that takes `delay` before answering
    pub fn slow_agent(&self, agent_id: &str, agent_type: &str, delay: Duration) {
        self.register(agent_id, agent_type);
        let id = agent_id.to_string();
        self.transport.register_handler(
            agent_id,
            Arc::new(move |req: AgentExecutionRequest| {
                let id = id.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, anyhow::Error>(AgentExecutionResult::success(
                        req.request_id,
                        id,
                        serde_json::json!({ "slow": true }),
                    ))
                }
            }),
        );
    }

    /// An agent that always raises an error
    pub fn broken_agent(&self, agent_id: &str, agent_type: &str) -> Arc<AtomicUsize> {
        self.register(agent_id, agent_type);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        self.transport.register_handler(
            agent_id,
            Arc::new(move |_req: AgentExecutionRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err::<AgentExecutionResult, _>(anyhow::anyhow!("agent crashed")) }
            }),
        );
        calls
    }
}

pub fn is_vote(request: &AgentExecutionRequest) -> bool {
    request.context.get("kind").and_then(Value::as_str) == Some("vote")
}

/// Config with fast timeouts and no retries
pub fn quick_config() -> OrchestrationConfig {
    let mut config = OrchestrationConfig::default();
    config.engine.backoff = agent_orchestrator::BackoffStrategy::None;
    config.orchestrator.default_constraints = ExecutionConstraints::default()
        .with_timeout_ms(1_000)
        .with_max_retries(0);
    config.orchestrator.coordination_timeout_ms = 1_000;
    config.orchestrator.coordination_poll_interval_ms = 10;
    config
}

pub fn event_types(result: &AgentExecutionResult) -> Vec<String> {
    result.metadata["events"]
        .as_array()
        .map(|events| {
            events
                .iter()
                .filter_map(|event| event["event_type"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
