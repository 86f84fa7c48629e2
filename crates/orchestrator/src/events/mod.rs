//! Orchestration events and metrics signals
//!
//! Every orchestration keeps an append-only log of [`OrchestrationEvent`]s.
//! Counters, gauges and histograms are emitted through a [`MetricsSink`]; the
//! default sink forwards them to `tracing`.

pub mod metrics;

pub use metrics::{
    metric_names, InMemoryMetricsSink, MetricsSink, NoopMetricsSink, TracingMetricsSink,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of entries in an orchestration's event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationEventType {
    OrchestrationStarted,
    PlanCreated,
    StepStarted,
    StepCompleted,
    StepFailed,
    ReplanningTriggered,
    CoordinationStarted,
    ConsensusEvaluated,
    DebateRoundCompleted,
    EvaluationCompleted,
    OrchestrationCompleted,
    OrchestrationFailed,
}

impl std::fmt::Display for OrchestrationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestrationEventType::OrchestrationStarted => "ORCHESTRATION_STARTED",
            OrchestrationEventType::PlanCreated => "PLAN_CREATED",
            OrchestrationEventType::StepStarted => "STEP_STARTED",
            OrchestrationEventType::StepCompleted => "STEP_COMPLETED",
            OrchestrationEventType::StepFailed => "STEP_FAILED",
            OrchestrationEventType::ReplanningTriggered => "REPLANNING_TRIGGERED",
            OrchestrationEventType::CoordinationStarted => "COORDINATION_STARTED",
            OrchestrationEventType::ConsensusEvaluated => "CONSENSUS_EVALUATED",
            OrchestrationEventType::DebateRoundCompleted => "DEBATE_ROUND_COMPLETED",
            OrchestrationEventType::EvaluationCompleted => "EVALUATION_COMPLETED",
            OrchestrationEventType::OrchestrationCompleted => "ORCHESTRATION_COMPLETED",
            OrchestrationEventType::OrchestrationFailed => "ORCHESTRATION_FAILED",
        };
        write!(f, "{}", name)
    }
}

/// One entry of an orchestration's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub event_type: OrchestrationEventType,
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<String>,
    pub payload: Value,
}

impl OrchestrationEvent {
    pub fn new(event_type: OrchestrationEventType, payload: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            step_id: None,
            payload,
        }
    }

    pub fn for_step(
        event_type: OrchestrationEventType,
        step_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            step_id: Some(step_id.into()),
            payload,
        }
    }
}
