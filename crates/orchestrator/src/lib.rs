//! Agent Orchestration Engine
//!
//! Turns a task description into a plan, runs the plan's steps on registered
//! agents under one of six topologies, evaluates the outcome and aggregates
//! one final result. Failed steps are replanned around when the failure is
//! recoverable.
//!
//! # Architecture
//!
//! - **AgentRegistry**: registered agents, capability lookup, heartbeat sweep
//! - **CircuitBreakerRegistry**: one breaker per agent
//! - **AgentCommunicationBus**: routes requests to in-process, broker or RPC transports
//! - **ExecutionEngine**: timeout, retry with backoff, breaker, idempotent cache
//! - **Planner**: strategy selection, plan construction and replanning
//! - **Evaluator**: weighted scoring of the step results
//! - **Coordinator**: collaboration and debate sessions, consensus
//! - **Orchestrator**: top-level control flow
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use agent_orchestrator::{
//!     AgentCommunicationBus, AgentEndpoint, AgentExecutionRequest, AgentExecutionResult,
//!     AgentRegistry, EndpointType, InProcessTransport, OrchestrationConfig,
//!     OrchestrationRequest, Orchestrator, Planner, Topology,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OrchestrationConfig::default();
//!     agent_orchestrator::telemetry::init_tracing(&config.telemetry);
//!
//!     let registry = Arc::new(AgentRegistry::new(config.registry.clone()));
//!     registry.start();
//!
//!     let transport = Arc::new(InProcessTransport::new());
//!     transport.register_handler(
//!         "echo",
//!         Arc::new(|req: AgentExecutionRequest| async move {
//!             Ok::<_, anyhow::Error>(AgentExecutionResult::success(
//!                 req.request_id,
//!                 "echo",
//!                 req.task.into(),
//!             ))
//!         }),
//!     );
//!     registry.register(
//!         "echo",
//!         "Echo",
//!         "COMMON_AGENT",
//!         ["REASONING"],
//!         AgentEndpoint::in_process("echo"),
//!         "default",
//!     )?;
//!
//!     let bus = Arc::new(
//!         AgentCommunicationBus::new(registry.clone())
//!             .with_transport(EndpointType::InProcess, transport),
//!     );
//!     let orchestrator = Orchestrator::from_config(&config, registry.clone(), bus, Planner::new())?;
//!
//!     let result = orchestrator
//!         .orchestrate(OrchestrationRequest::new("summarize the report").with_topology(Topology::Parallel))
//!         .await?;
//!     println!("{}: {}", result.status, result.output);
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod communication;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod evaluator;
pub mod events;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod reliability;
pub mod telemetry;
pub mod types;

pub use communication::{
    AgentCommunicationBus, AgentTransport, BrokerTransport, InProcessTransport, LocalAgent,
    MessageBroker, TransportError,
};
pub use config::{ConfigError, OrchestrationConfig};
pub use coordinator::{
    ConsensusRule, ConsensusStrategy, CoordinationError, CoordinationStatus, Coordinator,
    VoteCollector,
};
pub use engine::{EngineConfig, ExecutionEngine};
pub use evaluator::{EvaluationResult, EvaluationWeights, Evaluator};
pub use events::{MetricsSink, OrchestrationEvent, OrchestrationEventType};
pub use orchestrator::{
    OrchestrationContext, OrchestrationRequest, OrchestrationState, Orchestrator,
    OrchestratorConfig, OrchestratorError, Topology,
};
pub use planner::{Planner, PlanningError, PlanningRequest};
pub use registry::{AgentRegistry, RegistryConfig, RegistryError};
pub use reliability::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerRegistry, CircuitBreakerState,
};
pub use types::{
    AgentEndpoint, AgentExecutionRequest, AgentExecutionResult, AgentRegistration, AgentStatus,
    EndpointType, ExecutionConstraints, ExecutionError, ExecutionPlan, ExecutionStatus,
    PlanStep, PlanningStrategy,
};
