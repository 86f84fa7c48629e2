//! Failure categorisation and plan repair

use serde_json::Value;
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use super::analysis::roles;
use super::PlanningError;
use crate::types::{
    error_codes, AgentExecutionResult, ExecutionPlan, FailureCategory, PlanMetadata, PlanStep,
    StepStatus,
};

/// Step context key holding the factor applied to the step's execution time limit
pub const TIMEOUT_MULTIPLIER_KEY: &str = "timeout_multiplier";
/// Step context key naming the step an alternative stands in for
pub const REPLACES_KEY: &str = "replaces";

/// Categorise a failure from the codes on its errors, including wrapped cause codes
pub fn categorize_failure(result: &AgentExecutionResult) -> FailureCategory {
    let codes: Vec<&str> = result
        .errors
        .iter()
        .flat_map(|error| std::iter::once(error.code.as_str()).chain(error.cause_code()))
        .collect();

    if codes.contains(&error_codes::FATAL_ERROR) {
        FailureCategory::FatalError
    } else if codes.contains(&error_codes::TIMEOUT) {
        FailureCategory::Timeout
    } else if codes.iter().any(|code| {
        matches!(
            *code,
            error_codes::NO_AVAILABLE_AGENTS
                | error_codes::INSUFFICIENT_CAPABILITY
                | error_codes::CIRCUIT_OPEN
        )
    }) {
        FailureCategory::InsufficientCapability
    } else {
        FailureCategory::ExecutionError
    }
}

fn alternative_id(failed_step_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-alt-{}", failed_step_id, &suffix[..8])
}

fn alternative_from(failed: &PlanStep, description: String, agent_type: &str) -> PlanStep {
    let mut step = PlanStep {
        step_id: alternative_id(&failed.step_id),
        description,
        assigned_agent_type: agent_type.to_string(),
        step_context: failed.step_context.clone(),
        dependencies: failed.dependencies.clone(),
        status: StepStatus::Pending,
        result_ref: None,
    };
    step.step_context
        .insert(REPLACES_KEY.to_string(), Value::from(failed.step_id.clone()));
    step
}

/// Steps that stand in for `failed`, in execution order
pub fn alternatives_for(failed: &PlanStep, category: FailureCategory) -> Vec<PlanStep> {
    match category {
        FailureCategory::Timeout => {
            let mut first = alternative_from(
                failed,
                format!("{} (part 1 of 2)", failed.description),
                &failed.assigned_agent_type,
            );
            first
                .step_context
                .insert(TIMEOUT_MULTIPLIER_KEY.to_string(), Value::from(2));

            let mut second = alternative_from(
                failed,
                format!("{} (part 2 of 2)", failed.description),
                &failed.assigned_agent_type,
            );
            second
                .step_context
                .insert(TIMEOUT_MULTIPLIER_KEY.to_string(), Value::from(2));
            second.dependencies.insert(first.step_id.clone());

            vec![first, second]
        }
        FailureCategory::InsufficientCapability => vec![alternative_from(
            failed,
            failed.description.clone(),
            roles::COMMON_AGENT,
        )],
        FailureCategory::ExecutionError | FailureCategory::FatalError => {
            vec![alternative_from(
                failed,
                failed.description.clone(),
                &failed.assigned_agent_type,
            )]
        }
    }
}

/// Build a new plan around `failed_step`. Completed steps are carried over
/// untouched, alternatives take the failed step's place, and the steps that
/// have not run yet follow with their dependencies rewired.
pub fn rebuild_plan(
    original: &ExecutionPlan,
    failed_step: &PlanStep,
    failure: &AgentExecutionResult,
    completed_steps: &HashSet<String>,
) -> Result<ExecutionPlan, PlanningError> {
    let category = categorize_failure(failure);
    if !category.is_recoverable() {
        return Err(PlanningError::NonRecoverable {
            step_id: failed_step.step_id.clone(),
            category,
        });
    }

    let alternatives = alternatives_for(failed_step, category);
    let replacement_id = alternatives
        .last()
        .map(|step| step.step_id.clone())
        .unwrap_or_else(|| failed_step.step_id.clone());

    let mut steps: Vec<PlanStep> = original
        .steps
        .iter()
        .filter(|step| completed_steps.contains(&step.step_id))
        .cloned()
        .collect();
    steps.extend(alternatives.iter().cloned());

    for step in &original.steps {
        if step.step_id == failed_step.step_id || completed_steps.contains(&step.step_id) {
            continue;
        }
        let mut remaining = step.clone();
        if remaining.dependencies.remove(&failed_step.step_id) {
            remaining.dependencies.insert(replacement_id.clone());
        }
        steps.push(remaining);
    }

    let metadata = PlanMetadata {
        strategy: original.metadata.strategy,
        estimated_steps: steps.len(),
        estimated_duration_ms: original.metadata.estimated_duration_ms,
        confidence: (original.metadata.confidence * 0.9).clamp(0.0, 1.0),
        replanned_from: Some(original.plan_id.clone()),
        failed_step_id: Some(failed_step.step_id.clone()),
        failure_category: Some(category),
        replan_count: original.metadata.replan_count + 1,
    };

    let mut plan = ExecutionPlan::new(original.description.clone(), steps, metadata);
    plan.plan_context = original.plan_context.clone();

    info!(
        original_plan = %original.plan_id,
        new_plan = %plan.plan_id,
        failed_step = %failed_step.step_id,
        category = %category,
        alternatives = alternatives.len(),
        "Plan rebuilt after step failure"
    );
    Ok(plan)
}
