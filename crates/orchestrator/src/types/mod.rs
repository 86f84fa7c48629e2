//! Core data model shared by every component

pub mod agent;
pub mod execution;
pub mod plan;

pub use agent::{
    metadata_keys, AgentEndpoint, AgentRegistration, AgentStatus, EndpointType,
    DEFAULT_HEARTBEAT_TIMEOUT, WILDCARD_AGENT_TYPE,
};
pub use execution::{
    error_codes, AgentExecutionRequest, AgentExecutionResult, ErrorSeverity, ExecutionConstraints,
    ExecutionError, ExecutionMetrics, ExecutionStatus,
};
pub use plan::{
    ExecutionPlan, FailureCategory, PlanMetadata, PlanStep, PlanningStrategy, StepStatus,
};
