//! Live state of one orchestration run

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

use super::Topology;
use crate::events::{OrchestrationEvent, OrchestrationEventType};
use crate::types::{AgentExecutionResult, ExecutionConstraints, ExecutionPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationState {
    Planning,
    Executing,
    Evaluating,
    Completed,
    Failed,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationState::Completed | OrchestrationState::Failed)
    }
}

impl std::fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationState::Planning => write!(f, "planning"),
            OrchestrationState::Executing => write!(f, "executing"),
            OrchestrationState::Evaluating => write!(f, "evaluating"),
            OrchestrationState::Completed => write!(f, "completed"),
            OrchestrationState::Failed => write!(f, "failed"),
        }
    }
}

/// A failed step result that a replan took out of the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupersededStep {
    pub step_id: String,
    pub plan_id: String,
    pub result: AgentExecutionResult,
}

/// Shared by every step task of one orchestration. Step results are written
/// at most once per step id, and a successful step's output is also published
/// to the shared context under its step id. Events keep the order in which
/// they were recorded.
#[derive(Debug)]
pub struct OrchestrationContext {
    orchestration_id: String,
    parent_orchestration_id: Option<String>,
    topology: Topology,
    constraints: ExecutionConstraints,
    plan: RwLock<ExecutionPlan>,
    step_results: DashMap<String, AgentExecutionResult>,
    superseded: Mutex<Vec<SupersededStep>>,
    active_agents: DashMap<String, usize>,
    state: RwLock<OrchestrationState>,
    shared_context: DashMap<String, Value>,
    events: Mutex<Vec<OrchestrationEvent>>,
    replans: AtomicU32,
    started_at: DateTime<Utc>,
}

impl OrchestrationContext {
    pub fn new(
        orchestration_id: impl Into<String>,
        parent_orchestration_id: Option<String>,
        topology: Topology,
        plan: ExecutionPlan,
        shared_context: HashMap<String, Value>,
        constraints: ExecutionConstraints,
    ) -> Self {
        Self {
            orchestration_id: orchestration_id.into(),
            parent_orchestration_id,
            topology,
            constraints,
            plan: RwLock::new(plan),
            step_results: DashMap::new(),
            superseded: Mutex::new(Vec::new()),
            active_agents: DashMap::new(),
            state: RwLock::new(OrchestrationState::Planning),
            shared_context: shared_context.into_iter().collect(),
            events: Mutex::new(Vec::new()),
            replans: AtomicU32::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn orchestration_id(&self) -> &str {
        &self.orchestration_id
    }

    pub fn parent_orchestration_id(&self) -> Option<&str> {
        self.parent_orchestration_id.as_deref()
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn constraints(&self) -> &ExecutionConstraints {
        &self.constraints
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Snapshot of the current plan
    pub fn plan(&self) -> ExecutionPlan {
        self.plan.read().clone()
    }

    pub fn replace_plan(&self, plan: ExecutionPlan) -> u32 {
        *self.plan.write() = plan;
        self.replans.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn replan_count(&self) -> u32 {
        self.replans.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> OrchestrationState {
        *self.state.read()
    }

    pub fn set_state(&self, state: OrchestrationState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(
                orchestration_id = %self.orchestration_id,
                from = %*current,
                to = %state,
                "Orchestration state changed"
            );
            *current = state;
        }
    }

    /// Store the result for a step. Returns false if the step already has one.
    /// Successful outputs become visible to later steps through the shared
    /// context.
    pub fn record_result(&self, step_id: &str, result: AgentExecutionResult) -> bool {
        match self.step_results.entry(step_id.to_string()) {
            Entry::Occupied(_) => {
                warn!(
                    orchestration_id = %self.orchestration_id,
                    step_id,
                    "Step result already recorded, keeping the first"
                );
                false
            }
            Entry::Vacant(slot) => {
                if result.is_success() {
                    self.shared_context
                        .insert(step_id.to_string(), result.output.clone());
                }
                slot.insert(result);
                true
            }
        }
    }

    pub fn step_result(&self, step_id: &str) -> Option<AgentExecutionResult> {
        self.step_results.get(step_id).map(|r| r.clone())
    }

    pub fn step_results(&self) -> HashMap<String, AgentExecutionResult> {
        self.step_results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn completed_step_ids(&self) -> HashSet<String> {
        self.step_results
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Set aside a failed result produced under `plan_id`
    pub fn supersede(&self, step_id: &str, plan_id: &str, result: AgentExecutionResult) {
        self.superseded.lock().push(SupersededStep {
            step_id: step_id.to_string(),
            plan_id: plan_id.to_string(),
            result,
        });
    }

    pub fn superseded(&self) -> Vec<SupersededStep> {
        self.superseded.lock().clone()
    }

    pub fn agent_started(&self, agent_id: &str) {
        *self.active_agents.entry(agent_id.to_string()).or_insert(0) += 1;
    }

    pub fn agent_finished(&self, agent_id: &str) {
        self.active_agents.remove_if_mut(agent_id, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    /// Agents currently executing a step
    pub fn active_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .active_agents
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        agents.sort();
        agents
    }

    pub fn shared_value(&self, key: &str) -> Option<Value> {
        self.shared_context.get(key).map(|v| v.clone())
    }

    pub fn set_shared(&self, key: impl Into<String>, value: Value) {
        self.shared_context.insert(key.into(), value);
    }

    pub fn shared_context(&self) -> HashMap<String, Value> {
        self.shared_context
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn record_event(&self, event: OrchestrationEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().clone()
    }

    pub fn events_of(&self, event_type: OrchestrationEventType) -> Vec<OrchestrationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorSeverity, ExecutionError, PlanMetadata, PlanStep, PlanningStrategy};
    use serde_json::json;
    use std::sync::Arc;

    fn context() -> OrchestrationContext {
        let plan = ExecutionPlan::new(
            "t",
            vec![PlanStep::new("s1", "one", "COMMON_AGENT")],
            PlanMetadata::new(PlanningStrategy::Simple, 1),
        );
        OrchestrationContext::new(
            "o1",
            None,
            Topology::Parallel,
            plan,
            HashMap::from([("seed".to_string(), json!(true))]),
            ExecutionConstraints::default(),
        )
    }

    #[test]
    fn test_step_result_is_written_once() {
        let ctx = context();
        assert!(ctx.record_result("s1", AgentExecutionResult::success("r1", "a", json!(1))));
        assert!(!ctx.record_result("s1", AgentExecutionResult::success("r2", "b", json!(2))));
        assert_eq!(ctx.step_result("s1").map(|r| r.request_id), Some("r1".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_are_kept() {
        let ctx = Arc::new(context());
        let mut handles = Vec::new();
        for i in 0..32 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.record_result(
                    &format!("s{}", i),
                    AgentExecutionResult::success(format!("r{}", i), "a", json!(i)),
                );
                ctx.record_event(OrchestrationEvent::for_step(
                    OrchestrationEventType::StepCompleted,
                    format!("s{}", i),
                    json!({}),
                ));
            }));
        }
        for handle in handles {
            handle.await.expect("task finished");
        }
        assert_eq!(ctx.step_results().len(), 32);
        assert_eq!(ctx.events_of(OrchestrationEventType::StepCompleted).len(), 32);
    }

    #[test]
    fn test_active_agents_are_counted() {
        let ctx = context();
        ctx.agent_started("a");
        ctx.agent_started("a");
        ctx.agent_finished("a");
        assert_eq!(ctx.active_agents(), vec!["a".to_string()]);
        ctx.agent_finished("a");
        assert!(ctx.active_agents().is_empty());
    }

    #[test]
    fn test_replace_plan_counts_replans() {
        let ctx = context();
        assert_eq!(ctx.shared_value("seed"), Some(json!(true)));
        let next = ExecutionPlan::new("t2", vec![], PlanMetadata::new(PlanningStrategy::Simple, 0));
        assert_eq!(ctx.replace_plan(next.clone()), 1);
        assert_eq!(ctx.plan().plan_id, next.plan_id);
        assert_eq!(ctx.replan_count(), 1);
    }

    #[test]
    fn test_successful_outputs_are_shared() {
        let ctx = context();
        ctx.record_result("s1", AgentExecutionResult::success("r1", "a", json!({"rows": 3})));
        ctx.record_result(
            "s2",
            AgentExecutionResult::failure(
                "r2",
                "a",
                ExecutionError::new("AGENT_ERROR", "boom", ErrorSeverity::High, "agent"),
            ),
        );
        assert_eq!(ctx.shared_value("s1"), Some(json!({"rows": 3})));
        assert_eq!(ctx.shared_value("s2"), None);
    }
}
