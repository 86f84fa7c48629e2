//! Planner
//!
//! Turns a task description into an ordered, dependency-annotated
//! [`ExecutionPlan`] and repairs plans around failed steps.
//!
//! Strategy selection:
//! - HIGH complexity tasks are decomposed hierarchically
//! - tasks needing more than two capabilities get a plan-and-execute pipeline
//! - everything else gets a chain of thought from the reasoning generator,
//!   or a ReAct chain when no generator is configured
//!
//! A SIMPLE single-step plan is the fallback whenever reasoning fails.

pub mod analysis;
pub mod replan;

pub use analysis::{
    analyze_task, capabilities, capabilities_for_agent_type, roles, TaskAnalysis, TaskComplexity,
};
pub use replan::{categorize_failure, REPLACES_KEY, TIMEOUT_MULTIPLIER_KEY};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{
    AgentExecutionResult, ExecutionConstraints, ExecutionPlan, FailureCategory, PlanMetadata,
    PlanStep, PlanningStrategy,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanningError {
    #[error("Failure of step {step_id} is not recoverable ({category})")]
    NonRecoverable {
        step_id: String,
        category: FailureCategory,
    },

    #[error("Plan contains a dependency cycle among steps {remaining:?}")]
    DependencyCycle { remaining: Vec<String> },

    #[error("Reasoning chain unavailable: {reason}")]
    ReasoningUnavailable { reason: String },

    #[error("Invalid plan: {reason}")]
    InvalidPlan { reason: String },
}

/// Produces natural-language reasoning steps for chain-of-thought plans
#[async_trait]
pub trait ReasoningChainGenerator: Send + Sync {
    async fn generate_reasoning_chain(&self, task_description: &str)
        -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningRequest {
    pub task_description: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub constraints: ExecutionConstraints,
    /// Skip strategy selection and use this one
    #[serde(default)]
    pub strategy: Option<PlanningStrategy>,
}

impl PlanningRequest {
    pub fn new(task_description: impl Into<String>) -> Self {
        Self {
            task_description: task_description.into(),
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: PlanningStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_constraints(mut self, constraints: ExecutionConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

#[derive(Default)]
pub struct Planner {
    reasoning: Option<Arc<dyn ReasoningChainGenerator>>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reasoning(mut self, reasoning: Arc<dyn ReasoningChainGenerator>) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    pub fn analyze_task(&self, task_description: &str) -> TaskAnalysis {
        analyze_task(task_description)
    }

    pub fn select_strategy(&self, analysis: &TaskAnalysis) -> PlanningStrategy {
        if analysis.complexity == TaskComplexity::High {
            PlanningStrategy::Hierarchical
        } else if analysis.requires_specialization() {
            PlanningStrategy::PlanAndExecute
        } else {
            PlanningStrategy::ChainOfThought
        }
    }

    pub async fn create_plan(&self, request: &PlanningRequest) -> Result<ExecutionPlan, PlanningError> {
        let task = request.task_description.trim();
        if task.is_empty() {
            return Err(PlanningError::InvalidPlan {
                reason: "task description is empty".to_string(),
            });
        }

        let analysis = self.analyze_task(task);
        let selected = request
            .strategy
            .unwrap_or_else(|| self.select_strategy(&analysis));
        debug!(
            complexity = %analysis.complexity,
            capabilities = ?analysis.required_capabilities,
            strategy = %selected,
            "Task analysed"
        );

        let (strategy, steps) = match selected {
            PlanningStrategy::Hierarchical => (selected, hierarchical_steps(task, &analysis)),
            PlanningStrategy::PlanAndExecute => (selected, plan_and_execute_steps(task, &analysis)),
            PlanningStrategy::React => (selected, react_steps(task, &analysis)),
            PlanningStrategy::Simple => (selected, simple_steps(task, &analysis)),
            PlanningStrategy::ChainOfThought => match &self.reasoning {
                None => {
                    debug!("No reasoning generator configured, using ReAct");
                    (PlanningStrategy::React, react_steps(task, &analysis))
                }
                Some(reasoning) => match chain_of_thought_steps(reasoning.as_ref(), task).await {
                    Ok(steps) => (PlanningStrategy::ChainOfThought, steps),
                    Err(e) => {
                        warn!(error = %e, "Falling back to a simple plan");
                        (PlanningStrategy::Simple, simple_steps(task, &analysis))
                    }
                },
            },
        };

        let mut metadata = PlanMetadata::new(strategy, steps.len());
        metadata.estimated_duration_ms = request
            .constraints
            .max_execution_time_ms
            .saturating_mul(steps.len() as u64);
        metadata.confidence = analysis.complexity.confidence();

        let mut plan = ExecutionPlan::new(task, steps, metadata);
        plan.plan_context = request.context.clone();
        plan.plan_context.insert(
            "complexity".to_string(),
            Value::from(analysis.complexity.to_string()),
        );
        validate_plan(&plan)?;

        info!(
            plan_id = %plan.plan_id,
            strategy = %plan.metadata.strategy,
            steps = plan.len(),
            "Plan created"
        );
        Ok(plan)
    }

    pub async fn replan(
        &self,
        original: &ExecutionPlan,
        failed_step: &PlanStep,
        failure: &AgentExecutionResult,
        completed_steps: &HashSet<String>,
    ) -> Result<ExecutionPlan, PlanningError> {
        let plan = replan::rebuild_plan(original, failed_step, failure, completed_steps)?;
        validate_plan(&plan)?;
        Ok(plan)
    }
}

/// Unique step ids, dependencies that name existing steps, and no
/// dependency cycles.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<(), PlanningError> {
    let duplicates = plan.duplicate_step_ids();
    if !duplicates.is_empty() {
        return Err(PlanningError::InvalidPlan {
            reason: format!("duplicate step ids {:?}", duplicates),
        });
    }
    for step in &plan.steps {
        if let Some(missing) = step.dependencies.iter().find(|dep| !plan.contains_step(dep)) {
            return Err(PlanningError::InvalidPlan {
                reason: format!("step {} depends on unknown step {}", step.step_id, missing),
            });
        }
    }
    check_acyclic(plan)
}

/// Peel off steps whose dependencies are all satisfied until none are left.
/// Whatever cannot be peeled sits on or behind a cycle.
fn check_acyclic(plan: &ExecutionPlan) -> Result<(), PlanningError> {
    let mut satisfied: HashSet<String> = HashSet::with_capacity(plan.len());
    let mut remaining: Vec<&PlanStep> = plan.steps.iter().collect();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&PlanStep>, Vec<&PlanStep>) =
            remaining.into_iter().partition(|step| step.is_ready(&satisfied));
        if ready.is_empty() {
            return Err(PlanningError::DependencyCycle {
                remaining: blocked.iter().map(|step| step.step_id.clone()).collect(),
            });
        }
        satisfied.extend(ready.into_iter().map(|step| step.step_id.clone()));
        remaining = blocked;
    }
    Ok(())
}

fn task_step(
    step_id: impl Into<String>,
    description: impl Into<String>,
    agent_type: &str,
    task: &str,
) -> PlanStep {
    PlanStep::new(step_id, description, agent_type).with_context("task", task)
}

fn hierarchical_steps(task: &str, analysis: &TaskAnalysis) -> Vec<PlanStep> {
    let subtasks = analysis.estimated_steps.saturating_sub(2).max(1);
    let specialised = analysis.specialized_capabilities();

    let mut steps = vec![task_step(
        "decompose",
        format!("Decompose the task into {} subtasks: {}", subtasks, task),
        roles::PLANNER,
        task,
    )];

    let mut execute_ids = Vec::with_capacity(subtasks);
    for i in 1..=subtasks {
        let role = if specialised.is_empty() {
            roles::COMMON_AGENT
        } else {
            analysis::role_for_capability(specialised[(i - 1) % specialised.len()])
        };
        let step_id = format!("execute-{}", i);
        steps.push(
            task_step(&step_id, format!("Execute subtask {} of {}", i, subtasks), role, task)
                .with_context("subtask_index", i)
                .depends_on("decompose"),
        );
        execute_ids.push(step_id);
    }

    steps.push(
        task_step("aggregate", "Aggregate subtask results", roles::COMMON_AGENT, task)
            .with_dependencies(execute_ids),
    );
    steps
}

fn plan_and_execute_steps(task: &str, analysis: &TaskAnalysis) -> Vec<PlanStep> {
    vec![
        task_step(
            "detailed-planning",
            format!("Produce a detailed plan for: {}", task),
            roles::PLANNER,
            task,
        ),
        task_step("execute-plan", "Execute the detailed plan", analysis.primary_role(), task)
            .depends_on("detailed-planning"),
        task_step(
            "verify-results",
            "Verify the results against the task",
            roles::ANALYST_AGENT,
            task,
        )
        .depends_on("execute-plan"),
    ]
}

async fn chain_of_thought_steps(
    reasoning: &dyn ReasoningChainGenerator,
    task: &str,
) -> Result<Vec<PlanStep>, PlanningError> {
    let chain = reasoning
        .generate_reasoning_chain(task)
        .await
        .map_err(|e| PlanningError::ReasoningUnavailable {
            reason: e.to_string(),
        })?;

    let chain: Vec<String> = chain
        .into_iter()
        .map(|thought| thought.trim().to_string())
        .filter(|thought| !thought.is_empty())
        .collect();
    if chain.is_empty() {
        return Err(PlanningError::ReasoningUnavailable {
            reason: "reasoning chain is empty".to_string(),
        });
    }

    let mut steps: Vec<PlanStep> = Vec::with_capacity(chain.len());
    for (i, thought) in chain.into_iter().enumerate() {
        let prior: Vec<String> = steps.iter().map(|step| step.step_id.clone()).collect();
        steps.push(
            task_step(format!("cot-{}", i + 1), thought, roles::COMMON_AGENT, task)
                .with_dependencies(prior),
        );
    }
    Ok(steps)
}

fn react_steps(task: &str, analysis: &TaskAnalysis) -> Vec<PlanStep> {
    let cycles = analysis.estimated_steps.max(1);
    let mut steps = Vec::with_capacity(cycles * 2);
    let mut previous: Option<String> = None;

    for i in 1..=cycles {
        let reason_id = format!("reason-{}", i);
        let mut reason = task_step(
            &reason_id,
            format!("Reason about the next action ({} of {})", i, cycles),
            roles::COMMON_AGENT,
            task,
        );
        if let Some(prev) = previous.take() {
            reason = reason.depends_on(prev);
        }
        steps.push(reason);

        let act_id = format!("act-{}", i);
        steps.push(
            task_step(&act_id, format!("Act on reasoning step {}", i), analysis.primary_role(), task)
                .depends_on(reason_id),
        );
        previous = Some(act_id);
    }
    steps
}

fn simple_steps(task: &str, analysis: &TaskAnalysis) -> Vec<PlanStep> {
    vec![task_step("execute", task, analysis.primary_role(), task)]
}
