//! Dependency waves

use std::collections::HashSet;

use crate::planner::PlanningError;
use crate::types::{ExecutionPlan, PlanStep};

/// Group the plan's not yet completed steps into waves. Every step of a wave
/// depends only on `completed` steps and steps of earlier waves. Steps keep
/// plan order inside a wave.
///
/// Fails with [`PlanningError::DependencyCycle`] when steps remain but none
/// of them can be scheduled.
pub fn build_waves(
    plan: &ExecutionPlan,
    completed: &HashSet<String>,
) -> Result<Vec<Vec<PlanStep>>, PlanningError> {
    let mut done = completed.clone();
    let mut remaining: Vec<&PlanStep> = plan
        .steps
        .iter()
        .filter(|step| !completed.contains(&step.step_id))
        .collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&PlanStep>, Vec<&PlanStep>) =
            remaining.into_iter().partition(|step| step.is_ready(&done));

        if ready.is_empty() {
            return Err(PlanningError::DependencyCycle {
                remaining: blocked.iter().map(|step| step.step_id.clone()).collect(),
            });
        }

        done.extend(ready.iter().map(|step| step.step_id.clone()));
        waves.push(ready.into_iter().cloned().collect());
        remaining = blocked;
    }

    Ok(waves)
}

/// Not yet completed steps in plan order, one per wave
pub fn sequential_order(plan: &ExecutionPlan, completed: &HashSet<String>) -> Vec<Vec<PlanStep>> {
    plan.steps
        .iter()
        .filter(|step| !completed.contains(&step.step_id))
        .map(|step| vec![step.clone()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanMetadata, PlanningStrategy};

    fn plan(steps: Vec<PlanStep>) -> ExecutionPlan {
        let n = steps.len();
        ExecutionPlan::new("waves", steps, PlanMetadata::new(PlanningStrategy::Simple, n))
    }

    fn ids(waves: &[Vec<PlanStep>]) -> Vec<Vec<&str>> {
        waves
            .iter()
            .map(|wave| wave.iter().map(|s| s.step_id.as_str()).collect())
            .collect()
    }

    #[test]
    fn test_linear_chain_gives_one_step_per_wave() {
        let plan = plan(vec![
            PlanStep::new("a", "a", "X"),
            PlanStep::new("b", "b", "X").depends_on("a"),
            PlanStep::new("c", "c", "X").depends_on("b"),
        ]);
        let waves = build_waves(&plan, &HashSet::new()).expect("acyclic");
        assert_eq!(ids(&waves), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_fan_out_and_join() {
        let plan = plan(vec![
            PlanStep::new("decompose", "d", "X"),
            PlanStep::new("e1", "e", "X").depends_on("decompose"),
            PlanStep::new("e2", "e", "X").depends_on("decompose"),
            PlanStep::new("aggregate", "g", "X").with_dependencies(["e1", "e2"]),
        ]);
        let waves = build_waves(&plan, &HashSet::new()).expect("acyclic");
        assert_eq!(
            ids(&waves),
            vec![vec!["decompose"], vec!["e1", "e2"], vec!["aggregate"]]
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let plan = plan(vec![
            PlanStep::new("a", "a", "X").depends_on("b"),
            PlanStep::new("b", "b", "X").depends_on("a"),
        ]);
        match build_waves(&plan, &HashSet::new()) {
            Err(PlanningError::DependencyCycle { remaining }) => {
                assert_eq!(remaining, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected a cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_completed_steps_are_skipped() {
        let plan = plan(vec![
            PlanStep::new("a", "a", "X"),
            PlanStep::new("b", "b", "X").depends_on("a"),
        ]);
        let completed = HashSet::from(["a".to_string()]);
        assert_eq!(ids(&build_waves(&plan, &completed).expect("acyclic")), vec![vec!["b"]]);
        assert_eq!(ids(&sequential_order(&plan, &completed)), vec![vec!["b"]]);
    }
}
