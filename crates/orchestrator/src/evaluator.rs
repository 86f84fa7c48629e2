//! Evaluator
//!
//! Scores a finished orchestration on four weighted criteria (correctness,
//! completeness, quality, efficiency) and maps the overall score to a final
//! status. Recommendations are advisory text only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::types::{AgentExecutionResult, ExecutionPlan, ExecutionStatus};

/// Mean execution time at which efficiency reaches zero
pub const EFFICIENCY_BASELINE_MS: f64 = 30_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationWeights {
    pub correctness: f64,
    pub completeness: f64,
    pub quality: f64,
    pub efficiency: f64,
}

impl Default for EvaluationWeights {
    fn default() -> Self {
        Self {
            correctness: 0.4,
            completeness: 0.3,
            quality: 0.2,
            efficiency: 0.1,
        }
    }
}

impl EvaluationWeights {
    pub fn total(&self) -> f64 {
        self.correctness + self.completeness + self.quality + self.efficiency
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub correctness: f64,
    pub completeness: f64,
    pub quality: f64,
    pub efficiency: f64,
    pub overall_score: f64,
    pub status: ExecutionStatus,
    pub recommendations: Vec<String>,
}

/// ≥0.8 SUCCESS, ≥0.5 PARTIAL_SUCCESS, otherwise FAILED
pub fn status_for_score(score: f64) -> ExecutionStatus {
    if score >= 0.8 {
        ExecutionStatus::Success
    } else if score >= 0.5 {
        ExecutionStatus::PartialSuccess
    } else {
        ExecutionStatus::Failed
    }
}

#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    weights: EvaluationWeights,
}

impl Evaluator {
    pub fn new(weights: EvaluationWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &EvaluationWeights {
        &self.weights
    }

    pub fn evaluate(
        &self,
        plan: &ExecutionPlan,
        step_results: &HashMap<String, AgentExecutionResult>,
        shared_context: &HashMap<String, Value>,
    ) -> EvaluationResult {
        let count = step_results.len() as f64;

        let (correctness, quality, efficiency) = if step_results.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let successes = step_results.values().filter(|r| r.is_success()).count() as f64;
            let score_sum: f64 = step_results
                .values()
                .map(|r| r.metrics.success_score)
                .sum();
            let time_sum: f64 = step_results
                .values()
                .map(|r| r.metrics.execution_time_ms as f64)
                .sum();
            let mean_time = time_sum / count;
            (
                successes / count,
                (score_sum / count).clamp(0.0, 1.0),
                (1.0 - mean_time / EFFICIENCY_BASELINE_MS).max(0.0),
            )
        };

        let completeness = if plan.is_empty() {
            if step_results.is_empty() {
                0.0
            } else {
                1.0
            }
        } else {
            (count / plan.len() as f64).min(1.0)
        };

        let overall_score = self.weights.correctness * correctness
            + self.weights.completeness * completeness
            + self.weights.quality * quality
            + self.weights.efficiency * efficiency;

        let recommendations = recommendations(correctness, completeness, quality, efficiency);
        debug!(
            plan_id = %plan.plan_id,
            correctness,
            completeness,
            quality,
            efficiency,
            overall_score,
            shared_keys = shared_context.len(),
            "Orchestration evaluated"
        );

        EvaluationResult {
            correctness,
            completeness,
            quality,
            efficiency,
            overall_score,
            status: status_for_score(overall_score),
            recommendations,
        }
    }
}

fn recommendations(correctness: f64, completeness: f64, quality: f64, efficiency: f64) -> Vec<String> {
    let mut out = Vec::new();
    if correctness < 0.8 {
        out.push("Use more specialized agents for the failing steps".to_string());
    }
    if completeness < 1.0 {
        out.push("Some plan steps produced no result; review dependencies and replanning limits".to_string());
    }
    if quality < 0.7 {
        out.push("Agent success scores are low; refine step descriptions or context".to_string());
    }
    if efficiency < 0.7 {
        out.push("Improve task distribution to reduce execution time".to_string());
    }
    out
}
