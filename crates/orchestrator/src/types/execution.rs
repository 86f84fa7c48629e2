//! Execution requests, results and error records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Error codes shared between the engine, the planner and the orchestrator
pub mod error_codes {
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    pub const NO_AVAILABLE_AGENTS: &str = "NO_AVAILABLE_AGENTS";
    pub const INSUFFICIENT_CAPABILITY: &str = "INSUFFICIENT_CAPABILITY";
    pub const FATAL_ERROR: &str = "FATAL_ERROR";

    /// Context key under which a wrapping error keeps the original code
    pub const CAUSE_CODE_KEY: &str = "cause_code";
}

/// Caller-supplied execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConstraints {
    pub max_execution_time_ms: u64,
    pub max_retries: u32,
    /// Any other caller-supplied limits, passed through to agents untouched
    pub extra: HashMap<String, Value>,
}

impl Default for ExecutionConstraints {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000,
            max_retries: 3,
            extra: HashMap::new(),
        }
    }
}

impl ExecutionConstraints {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    pub fn with_timeout_ms(mut self, max_execution_time_ms: u64) -> Self {
        self.max_execution_time_ms = max_execution_time_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A unit of work dispatched to one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionRequest {
    pub request_id: String,
    pub orchestration_id: Option<String>,
    pub step_id: Option<String>,
    pub task: String,
    pub context: HashMap<String, Value>,
    pub constraints: ExecutionConstraints,
}

impl AgentExecutionRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            orchestration_id: None,
            step_id: None,
            task: task.into(),
            context: HashMap::new(),
            constraints: ExecutionConstraints::default(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_constraints(mut self, constraints: ExecutionConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::PartialSuccess => write!(f, "partial_success"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub execution_time_ms: u64,
    pub tokens_used: u64,
    pub tool_invocations: u32,
    /// Agent-reported quality of the result, 0..1
    pub success_score: f64,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Structured error attached to an execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl ExecutionError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
        source: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            source: source.into(),
            timestamp: Utc::now(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// The original code when this error wraps another one
    pub fn cause_code(&self) -> Option<&str> {
        self.context
            .get(error_codes::CAUSE_CODE_KEY)
            .and_then(Value::as_str)
    }
}

/// Outcome of one agent execution, or of a whole orchestration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    pub request_id: String,
    pub agent_id: String,
    pub status: ExecutionStatus,
    pub output: Value,
    pub actions_taken: Vec<String>,
    pub metrics: ExecutionMetrics,
    pub errors: Vec<ExecutionError>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl AgentExecutionResult {
    pub fn success(
        request_id: impl Into<String>,
        agent_id: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            agent_id: agent_id.into(),
            status: ExecutionStatus::Success,
            output,
            actions_taken: Vec::new(),
            metrics: ExecutionMetrics {
                success_score: 1.0,
                ..Default::default()
            },
            errors: Vec::new(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        agent_id: impl Into<String>,
        error: ExecutionError,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            agent_id: agent_id.into(),
            status: ExecutionStatus::Failed,
            output: Value::Null,
            actions_taken: Vec::new(),
            metrics: ExecutionMetrics::default(),
            errors: vec![error],
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_score(mut self, success_score: f64) -> Self {
        self.metrics.success_score = success_score;
        self
    }

    pub fn with_execution_time(mut self, execution_time: Duration) -> Self {
        self.metrics.execution_time_ms = execution_time.as_millis() as u64;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.actions_taken.push(action.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }

    /// Message of the first attached error, if any
    pub fn first_error_message(&self) -> Option<&str> {
        self.errors.first().map(|e| e.message.as_str())
    }
}
