//! Execution plans

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Planning strategy that produced a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanningStrategy {
    Hierarchical,
    PlanAndExecute,
    ChainOfThought,
    React,
    Simple,
}

impl std::fmt::Display for PlanningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanningStrategy::Hierarchical => write!(f, "hierarchical"),
            PlanningStrategy::PlanAndExecute => write!(f, "plan_and_execute"),
            PlanningStrategy::ChainOfThought => write!(f, "chain_of_thought"),
            PlanningStrategy::React => write!(f, "react"),
            PlanningStrategy::Simple => write!(f, "simple"),
        }
    }
}

/// Why a step failed, as judged by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    Timeout,
    InsufficientCapability,
    ExecutionError,
    FatalError,
}

impl FailureCategory {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FailureCategory::FatalError)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCategory::Timeout => write!(f, "timeout"),
            FailureCategory::InsufficientCapability => write!(f, "insufficient_capability"),
            FailureCategory::ExecutionError => write!(f, "execution_error"),
            FailureCategory::FatalError => write!(f, "fatal_error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One step of a plan. `dependencies` name step ids that must complete first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub description: String,
    pub assigned_agent_type: String,
    pub step_context: HashMap<String, Value>,
    pub dependencies: BTreeSet<String>,
    pub status: StepStatus,
    pub result_ref: Option<String>,
}

impl PlanStep {
    pub fn new(
        step_id: impl Into<String>,
        description: impl Into<String>,
        assigned_agent_type: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            description: description.into(),
            assigned_agent_type: assigned_agent_type.into(),
            step_context: HashMap::new(),
            dependencies: BTreeSet::new(),
            status: StepStatus::Pending,
            result_ref: None,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.insert(step_id.into());
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.step_context.insert(key.into(), value.into());
        self
    }

    pub fn is_ready(&self, completed: &HashSet<String>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// Plan-level metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub strategy: PlanningStrategy,
    pub estimated_steps: usize,
    pub estimated_duration_ms: u64,
    pub confidence: f64,
    #[serde(default)]
    pub replanned_from: Option<String>,
    #[serde(default)]
    pub failed_step_id: Option<String>,
    #[serde(default)]
    pub failure_category: Option<FailureCategory>,
    #[serde(default)]
    pub replan_count: u32,
}

impl PlanMetadata {
    pub fn new(strategy: PlanningStrategy, estimated_steps: usize) -> Self {
        Self {
            strategy,
            estimated_steps,
            estimated_duration_ms: 0,
            confidence: 0.0,
            replanned_from: None,
            failed_step_id: None,
            failure_category: None,
            replan_count: 0,
        }
    }

    pub fn is_replan(&self) -> bool {
        self.replanned_from.is_some()
    }
}

/// An ordered, dependency-annotated plan. Replanning produces a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub description: String,
    pub steps: Vec<PlanStep>,
    pub plan_context: HashMap<String, Value>,
    pub metadata: PlanMetadata,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(description: impl Into<String>, steps: Vec<PlanStep>, metadata: PlanMetadata) -> Self {
        Self {
            plan_id: Uuid::new_v4().to_string(),
            description: description.into(),
            steps,
            plan_context: HashMap::new(),
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    pub fn contains_step(&self, step_id: &str) -> bool {
        self.step(step_id).is_some()
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.step_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step ids that appear more than once
    pub fn duplicate_step_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                duplicates.push(step.step_id.clone());
            }
        }
        duplicates
    }
}
