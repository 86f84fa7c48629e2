//! Orchestrator
//!
//! Drives one orchestration from task to final result:
//!
//! 1. PLANNING: the planner turns the task into an [`ExecutionPlan`]
//! 2. EXECUTING: the plan runs under the configured [`Topology`]; a failing
//!    step is either replanned around or escalated
//! 3. EVALUATING: the evaluator scores the step results
//! 4. COMPLETED / FAILED: the step results are aggregated into one
//!    [`AgentExecutionResult`], or an [`OrchestratorError`] carrying the
//!    failing step and its errors is returned
//!
//! The live [`OrchestrationContext`] is visible through
//! [`Orchestrator::get_context`] while the run is active and removed on every
//! exit path.

pub mod context;
pub mod scoring;
pub mod waves;

pub use context::{OrchestrationContext, OrchestrationState, SupersededStep};
pub use scoring::{score_agent, select_agent};
pub use waves::{build_waves, sequential_order};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::communication::AgentCommunicationBus;
use crate::config::{ConfigError, OrchestrationConfig};
use crate::coordinator::{
    BusVoteCollector, ConsensusRule, CoordinationError, Coordinator, DebateArgument,
};
use crate::engine::ExecutionEngine;
use crate::evaluator::Evaluator;
use crate::events::{
    metric_names, MetricsSink, OrchestrationEvent, OrchestrationEventType, TracingMetricsSink,
};
use crate::planner::{
    capabilities_for_agent_type, validate_plan, Planner, PlanningError, PlanningRequest,
    TIMEOUT_MULTIPLIER_KEY,
};
use crate::registry::AgentRegistry;
use crate::reliability::CircuitBreakerRegistry;
use crate::types::{
    error_codes, AgentExecutionRequest, AgentExecutionResult, ErrorSeverity,
    ExecutionConstraints, ExecutionError, ExecutionMetrics, ExecutionPlan, PlanStep,
    PlanningStrategy,
};

/// Agent id on aggregated orchestration results
pub const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";
/// Shared context and metadata key naming the winning competitive attempt
pub const COMPETITIVE_WINNER_KEY: &str = "competitive_winner";
/// Shared context key holding the collaboration consensus summary
pub const CONSENSUS_KEY: &str = "consensus";
/// Shared context key holding the debate summary
pub const DEBATE_KEY: &str = "debate";

const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// How the steps of a plan are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    Sequential,
    Parallel,
    Hierarchical,
    Collaborative,
    Competitive,
    Debate,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Sequential => write!(f, "sequential"),
            Topology::Parallel => write!(f, "parallel"),
            Topology::Hierarchical => write!(f, "hierarchical"),
            Topology::Collaborative => write!(f, "collaborative"),
            Topology::Competitive => write!(f, "competitive"),
            Topology::Debate => write!(f, "debate"),
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Topology used when a request does not name one
    pub topology: Topology,

    /// Replan around failed steps instead of failing the orchestration
    pub adaptive_planning: bool,

    /// Replans allowed per orchestration before a failure is escalated
    pub max_replans: u32,

    /// Constraints applied to requests that carry none
    pub default_constraints: ExecutionConstraints,

    pub coordination_poll_interval_ms: u64,
    pub coordination_timeout_ms: u64,

    pub max_debate_rounds: u32,

    pub consensus: ConsensusRule,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Sequential,
            adaptive_planning: true,
            max_replans: 3,
            default_constraints: ExecutionConstraints::default(),
            coordination_poll_interval_ms: 100,
            coordination_timeout_ms: 60_000,
            max_debate_rounds: 3,
            consensus: ConsensusRule::Majority,
        }
    }
}

impl OrchestratorConfig {
    pub fn coordination_poll_interval(&self) -> Duration {
        Duration::from_millis(self.coordination_poll_interval_ms)
    }

    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination_timeout_ms)
    }
}

fn describe(errors: &[ExecutionError]) -> String {
    match errors.first() {
        Some(first) if errors.len() > 1 => {
            format!("{}: {} (+{} more)", first.code, first.message, errors.len() - 1)
        }
        Some(first) => format!("{}: {}", first.code, first.message),
        None => "no error details".to_string(),
    }
}

/// Terminal orchestration failure. Step-driven variants keep the failing
/// step id and every error collected for it.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("Coordination failed: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Step {step_id} failed: {}", describe(.errors))]
    StepFailed {
        step_id: String,
        errors: Vec<ExecutionError>,
    },

    #[error("Step {step_id} failed and cannot be replanned ({reason}): {}", describe(.errors))]
    NonRecoverable {
        step_id: String,
        reason: String,
        errors: Vec<ExecutionError>,
    },

    #[error("Step {step_id} failed after {replans} replans: {}", describe(.errors))]
    ReplanLimitExceeded {
        step_id: String,
        replans: u32,
        errors: Vec<ExecutionError>,
    },

    #[error("Orchestration {orchestration_id} is already active")]
    AlreadyActive { orchestration_id: String },
}

impl OrchestratorError {
    pub fn step_id(&self) -> Option<&str> {
        match self {
            OrchestratorError::StepFailed { step_id, .. }
            | OrchestratorError::NonRecoverable { step_id, .. }
            | OrchestratorError::ReplanLimitExceeded { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    pub fn step_errors(&self) -> &[ExecutionError] {
        match self {
            OrchestratorError::StepFailed { errors, .. }
            | OrchestratorError::NonRecoverable { errors, .. }
            | OrchestratorError::ReplanLimitExceeded { errors, .. } => errors,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    /// Generated when absent
    pub orchestration_id: Option<String>,
    pub parent_orchestration_id: Option<String>,
    pub task_description: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Falls back to the configured default constraints
    pub constraints: Option<ExecutionConstraints>,
    /// Falls back to the configured topology
    pub topology: Option<Topology>,
    /// Skip strategy selection in the planner
    pub strategy: Option<PlanningStrategy>,
}

impl OrchestrationRequest {
    pub fn new(task_description: impl Into<String>) -> Self {
        Self {
            task_description: task_description.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, orchestration_id: impl Into<String>) -> Self {
        self.orchestration_id = Some(orchestration_id.into());
        self
    }

    pub fn with_parent(mut self, parent_orchestration_id: impl Into<String>) -> Self {
        self.parent_orchestration_id = Some(parent_orchestration_id.into());
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_strategy(mut self, strategy: PlanningStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_constraints(mut self, constraints: ExecutionConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// How steps are grouped into batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    /// One step at a time in plan order, each seeing the previous output
    Sequential,
    /// Dependency waves
    Waves,
    /// Dependency waves, each step seeing its parents' outputs
    Tree,
}

/// Removes an orchestration from the active table and closes its
/// coordination session when dropped
struct ActiveOrchestration<'a> {
    active: &'a DashMap<String, Arc<OrchestrationContext>>,
    coordinator: &'a Coordinator,
    orchestration_id: String,
}

impl Drop for ActiveOrchestration<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.orchestration_id);
        self.coordinator.close_session(&self.orchestration_id);
        debug!(orchestration_id = %self.orchestration_id, "Orchestration context released");
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    planner: Arc<Planner>,
    registry: Arc<AgentRegistry>,
    engine: Arc<ExecutionEngine>,
    coordinator: Arc<Coordinator>,
    evaluator: Evaluator,
    metrics: Arc<dyn MetricsSink>,
    active: DashMap<String, Arc<OrchestrationContext>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        planner: Arc<Planner>,
        registry: Arc<AgentRegistry>,
        engine: Arc<ExecutionEngine>,
        coordinator: Arc<Coordinator>,
        evaluator: Evaluator,
    ) -> Self {
        Self {
            config,
            planner,
            registry,
            engine,
            coordinator,
            evaluator,
            metrics: Arc::new(TracingMetricsSink),
            active: DashMap::new(),
        }
    }

    /// Wire every component from one validated configuration. The engine
    /// reports agent outcomes back into `registry`; votes are collected over
    /// `bus`.
    pub fn from_config(
        config: &OrchestrationConfig,
        registry: Arc<AgentRegistry>,
        bus: Arc<AgentCommunicationBus>,
        planner: Planner,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone()).map_err(|e| {
            ConfigError::Invalid {
                reason: e.to_string(),
            }
        })?;
        let engine = ExecutionEngine::new(config.engine.clone(), bus.clone(), Arc::new(breakers))
            .with_metrics_hook(registry.clone());
        let collector = BusVoteCollector::new(bus, config.orchestrator.default_constraints.clone());
        let coordinator = Coordinator::new(registry.clone(), Arc::new(collector));

        Ok(Self::new(
            config.orchestrator.clone(),
            Arc::new(planner),
            registry,
            Arc::new(engine),
            Arc::new(coordinator),
            Evaluator::new(config.evaluation.clone()),
        ))
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn planner(&self) -> &Arc<Planner> {
        &self.planner
    }

    /// Ids of orchestrations that have not reached a terminal state
    pub fn active_orchestrations(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_context(&self, orchestration_id: &str) -> Option<Arc<OrchestrationContext>> {
        self.active.get(orchestration_id).map(|entry| entry.value().clone())
    }

    /// Plan the request's task and run it to a final result
    #[instrument(
        skip(self, request),
        fields(orchestration_id = tracing::field::Empty, topology = tracing::field::Empty)
    )]
    pub async fn orchestrate(
        &self,
        request: OrchestrationRequest,
    ) -> Result<AgentExecutionResult, OrchestratorError> {
        self.run(request, None).await
    }

    /// Run a caller-supplied plan, skipping the planning phase
    #[instrument(
        skip(self, request, plan),
        fields(orchestration_id = tracing::field::Empty, topology = tracing::field::Empty)
    )]
    pub async fn orchestrate_plan(
        &self,
        request: OrchestrationRequest,
        plan: ExecutionPlan,
    ) -> Result<AgentExecutionResult, OrchestratorError> {
        self.run(request, Some(plan)).await
    }

    async fn run(
        &self,
        request: OrchestrationRequest,
        plan: Option<ExecutionPlan>,
    ) -> Result<AgentExecutionResult, OrchestratorError> {
        let started = Instant::now();
        let orchestration_id = request
            .orchestration_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let topology = request.topology.unwrap_or(self.config.topology);
        let constraints = request
            .constraints
            .clone()
            .unwrap_or_else(|| self.config.default_constraints.clone());

        let span = Span::current();
        span.record("orchestration_id", orchestration_id.as_str());
        span.record("topology", tracing::field::display(topology));

        if self.active.contains_key(&orchestration_id) {
            return Err(OrchestratorError::AlreadyActive { orchestration_id });
        }

        let plan = match self.prepare_plan(&request, plan, &constraints).await {
            Ok(plan) => plan,
            Err(e) => {
                error!(orchestration_id = %orchestration_id, error = %e, "Planning failed");
                self.metrics
                    .increment_counter(metric_names::ORCHESTRATIONS_FAILED, 1);
                return Err(e);
            }
        };

        let ctx = Arc::new(OrchestrationContext::new(
            orchestration_id.clone(),
            request.parent_orchestration_id.clone(),
            topology,
            plan.clone(),
            request.context.clone(),
            constraints,
        ));
        match self.active.entry(orchestration_id.clone()) {
            Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyActive { orchestration_id });
            }
            Entry::Vacant(slot) => {
                slot.insert(ctx.clone());
            }
        }
        let _active = ActiveOrchestration {
            active: &self.active,
            coordinator: &self.coordinator,
            orchestration_id: orchestration_id.clone(),
        };

        ctx.record_event(OrchestrationEvent::new(
            OrchestrationEventType::OrchestrationStarted,
            json!({
                "task": request.task_description,
                "topology": topology,
                "parent_orchestration_id": request.parent_orchestration_id,
            }),
        ));
        ctx.record_event(OrchestrationEvent::new(
            OrchestrationEventType::PlanCreated,
            json!({
                "plan_id": plan.plan_id,
                "strategy": plan.metadata.strategy,
                "steps": plan.step_ids(),
            }),
        ));
        info!(
            orchestration_id = %orchestration_id,
            plan_id = %plan.plan_id,
            steps = plan.len(),
            topology = %topology,
            "Orchestration started"
        );

        ctx.set_state(OrchestrationState::Executing);
        if let Err(e) = self.execute_topology(&ctx).await {
            ctx.set_state(OrchestrationState::Failed);
            ctx.record_event(OrchestrationEvent::new(
                OrchestrationEventType::OrchestrationFailed,
                json!({ "error": e.to_string(), "step_id": e.step_id() }),
            ));
            self.metrics
                .increment_counter(metric_names::ORCHESTRATIONS_FAILED, 1);
            error!(
                orchestration_id = %orchestration_id,
                step_id = e.step_id().unwrap_or_default(),
                error = %e,
                "Orchestration failed"
            );
            return Err(e);
        }

        ctx.set_state(OrchestrationState::Evaluating);
        let result = self.finish(&ctx, started);
        ctx.set_state(OrchestrationState::Completed);

        self.metrics
            .increment_counter(metric_names::ORCHESTRATIONS_COMPLETED, 1);
        self.metrics.record_histogram(
            metric_names::ORCHESTRATION_DURATION_MS,
            started.elapsed().as_millis() as f64,
        );
        info!(
            orchestration_id = %orchestration_id,
            status = %result.status,
            score = result.metrics.success_score,
            elapsed_ms = result.metrics.execution_time_ms,
            "Orchestration completed"
        );
        Ok(result)
    }

    async fn prepare_plan(
        &self,
        request: &OrchestrationRequest,
        plan: Option<ExecutionPlan>,
        constraints: &ExecutionConstraints,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        let plan = match plan {
            Some(plan) => plan,
            None => {
                let planning = PlanningRequest {
                    task_description: request.task_description.clone(),
                    context: request.context.clone(),
                    constraints: constraints.clone(),
                    strategy: request.strategy,
                };
                self.planner.create_plan(&planning).await?
            }
        };
        if plan.is_empty() {
            return Err(PlanningError::InvalidPlan {
                reason: "plan has no steps".to_string(),
            }
            .into());
        }
        validate_plan(&plan)?;
        Ok(plan)
    }

    async fn execute_topology(&self, ctx: &OrchestrationContext) -> Result<(), OrchestratorError> {
        info!(
            orchestration_id = %ctx.orchestration_id(),
            topology = %ctx.topology(),
            "Dispatching topology"
        );
        match ctx.topology() {
            Topology::Sequential => self.run_scheduled(ctx, Schedule::Sequential, false).await,
            Topology::Parallel => self.run_scheduled(ctx, Schedule::Waves, false).await,
            Topology::Hierarchical => self.run_scheduled(ctx, Schedule::Tree, false).await,
            Topology::Collaborative => self.run_collaborative(ctx).await,
            Topology::Competitive => self.run_competitive(ctx).await,
            Topology::Debate => self.run_debate(ctx).await,
        }
    }

    /// Run the plan batch by batch. A failed step stops the current pass;
    /// after a replan the pass restarts over the new plan, skipping steps
    /// that already have a result.
    async fn run_scheduled(
        &self,
        ctx: &OrchestrationContext,
        schedule: Schedule,
        collaborate: bool,
    ) -> Result<(), OrchestratorError> {
        loop {
            let plan = ctx.plan();
            let completed = ctx.completed_step_ids();
            let batches = match schedule {
                Schedule::Sequential => sequential_order(&plan, &completed),
                Schedule::Waves | Schedule::Tree => build_waves(&plan, &completed)?,
            };
            if batches.is_empty() {
                return Ok(());
            }

            let mut replanned = false;
            for (index, batch) in batches.iter().enumerate() {
                debug!(
                    orchestration_id = %ctx.orchestration_id(),
                    batch = index,
                    steps = batch.len(),
                    "Executing batch"
                );
                let plan = &plan;
                let runs = batch.iter().map(|step| {
                    let inputs = self.step_inputs(ctx, plan, step, schedule);
                    let request_id = format!("{}-{}", ctx.orchestration_id(), step.step_id);
                    async move {
                        let result = self.execute_step(ctx, plan, step, inputs, request_id).await;
                        (step, result)
                    }
                });
                let outcomes = join_all(runs).await;

                let mut failures = Vec::new();
                for (step, result) in outcomes {
                    if result.is_failed() {
                        failures.push((step, result));
                        continue;
                    }
                    if collaborate {
                        self.coordinator.record_contribution(
                            ctx.orchestration_id(),
                            &step.step_id,
                            &result.agent_id,
                            result.output.clone(),
                        )?;
                    }
                    ctx.record_result(&step.step_id, result);
                }

                let mut failures = failures.into_iter();
                if let Some((step, result)) = failures.next() {
                    self.handle_step_failure(ctx, step, result).await?;
                    // Other failures of the batch are still in the new plan and run again
                    for (step, result) in failures {
                        ctx.supersede(&step.step_id, &plan.plan_id, result);
                    }
                    replanned = true;
                    break;
                }
            }

            if !replanned {
                return Ok(());
            }
        }
    }

    fn step_inputs(
        &self,
        ctx: &OrchestrationContext,
        plan: &ExecutionPlan,
        step: &PlanStep,
        schedule: Schedule,
    ) -> HashMap<String, Value> {
        let mut inputs = HashMap::new();
        match schedule {
            Schedule::Sequential => {
                let previous = plan
                    .steps
                    .iter()
                    .take_while(|candidate| candidate.step_id != step.step_id)
                    .filter_map(|candidate| ctx.step_result(&candidate.step_id))
                    .last();
                if let Some(previous) = previous {
                    inputs.insert("previous_output".to_string(), previous.output);
                }
            }
            Schedule::Tree => {
                let parents: Map<String, Value> = step
                    .dependencies
                    .iter()
                    .filter_map(|dep| ctx.step_result(dep).map(|r| (dep.clone(), r.output)))
                    .collect();
                inputs.insert("parent_outputs".to_string(), Value::Object(parents));
            }
            Schedule::Waves => {
                let upstream: Map<String, Value> = step
                    .dependencies
                    .iter()
                    .filter_map(|dep| ctx.step_result(dep).map(|r| (dep.clone(), r.output)))
                    .collect();
                inputs.insert("dependency_outputs".to_string(), Value::Object(upstream));
            }
        }
        inputs
    }

    fn build_request(
        &self,
        ctx: &OrchestrationContext,
        plan: &ExecutionPlan,
        step: &PlanStep,
        request_id: String,
        inputs: HashMap<String, Value>,
    ) -> AgentExecutionRequest {
        let mut context = plan.plan_context.clone();
        context.extend(ctx.shared_context());
        context.extend(step.step_context.clone());
        context.extend(inputs);
        context.insert("step_id".to_string(), Value::from(step.step_id.clone()));

        let mut constraints = ctx.constraints().clone();
        if let Some(multiplier) = step
            .step_context
            .get(TIMEOUT_MULTIPLIER_KEY)
            .and_then(Value::as_f64)
            .filter(|m| *m > 0.0)
        {
            constraints.max_execution_time_ms =
                (constraints.max_execution_time_ms as f64 * multiplier).round() as u64;
        }

        let mut request = AgentExecutionRequest::new(step.description.clone())
            .with_request_id(request_id)
            .with_context(context)
            .with_constraints(constraints);
        request.orchestration_id = Some(ctx.orchestration_id().to_string());
        request.step_id = Some(step.step_id.clone());
        request
    }

    /// Select an agent for the step and run it through the engine. Never fails:
    /// a missing agent becomes a FAILED result with NO_AVAILABLE_AGENTS.
    async fn execute_step(
        &self,
        ctx: &OrchestrationContext,
        plan: &ExecutionPlan,
        step: &PlanStep,
        inputs: HashMap<String, Value>,
        request_id: String,
    ) -> AgentExecutionResult {
        let required = capabilities_for_agent_type(&step.assigned_agent_type);
        let candidates = self
            .registry
            .find_available(&step.assigned_agent_type, &required);

        let heartbeat_timeout = self.registry.config().heartbeat_timeout();
        let Some(agent) = select_agent(&candidates, heartbeat_timeout) else {
            warn!(
                orchestration_id = %ctx.orchestration_id(),
                step_id = %step.step_id,
                agent_type = %step.assigned_agent_type,
                required = ?required,
                "No available agents for step"
            );
            let error = ExecutionError::new(
                error_codes::NO_AVAILABLE_AGENTS,
                format!(
                    "No available agents of type {} with capabilities {:?}",
                    step.assigned_agent_type, required
                ),
                ErrorSeverity::High,
                ORCHESTRATOR_SOURCE,
            )
            .with_context("agent_type", step.assigned_agent_type.clone());
            let result = AgentExecutionResult::failure(request_id, "", error);
            ctx.record_event(OrchestrationEvent::for_step(
                OrchestrationEventType::StepFailed,
                step.step_id.clone(),
                json!({ "errors": result.errors }),
            ));
            return result;
        };

        ctx.record_event(OrchestrationEvent::for_step(
            OrchestrationEventType::StepStarted,
            step.step_id.clone(),
            json!({
                "agent_id": agent.agent_id,
                "agent_type": step.assigned_agent_type,
                "request_id": request_id,
            }),
        ));
        let request = self.build_request(ctx, plan, step, request_id, inputs);

        ctx.agent_started(&agent.agent_id);
        let result = self.engine.execute_with_agent(agent, &request).await;
        ctx.agent_finished(&agent.agent_id);

        if result.is_failed() {
            warn!(
                orchestration_id = %ctx.orchestration_id(),
                step_id = %step.step_id,
                agent_id = %agent.agent_id,
                error = result.first_error_message().unwrap_or_default(),
                "Step failed"
            );
            ctx.record_event(OrchestrationEvent::for_step(
                OrchestrationEventType::StepFailed,
                step.step_id.clone(),
                json!({ "agent_id": agent.agent_id, "errors": result.errors }),
            ));
        } else {
            debug!(
                orchestration_id = %ctx.orchestration_id(),
                step_id = %step.step_id,
                agent_id = %agent.agent_id,
                "Step completed"
            );
            ctx.record_event(OrchestrationEvent::for_step(
                OrchestrationEventType::StepCompleted,
                step.step_id.clone(),
                json!({
                    "agent_id": agent.agent_id,
                    "status": result.status,
                    "execution_time_ms": result.metrics.execution_time_ms,
                }),
            ));
        }
        result
    }

    /// Replan around a failed step, or escalate the failure when adaptive
    /// planning is off, the replan limit is reached or the planner refuses.
    async fn handle_step_failure(
        &self,
        ctx: &OrchestrationContext,
        step: &PlanStep,
        result: AgentExecutionResult,
    ) -> Result<(), OrchestratorError> {
        let step_id = step.step_id.clone();

        if !self.config.adaptive_planning {
            let errors = result.errors.clone();
            ctx.record_result(&step_id, result);
            return Err(OrchestratorError::StepFailed { step_id, errors });
        }

        let replans = ctx.replan_count();
        if replans >= self.config.max_replans {
            let errors = result.errors.clone();
            ctx.record_result(&step_id, result);
            return Err(OrchestratorError::ReplanLimitExceeded {
                step_id,
                replans,
                errors,
            });
        }

        let plan = ctx.plan();
        let completed = ctx.completed_step_ids();
        match self.planner.replan(&plan, step, &result, &completed).await {
            Ok(next) => {
                let next_plan_id = next.plan_id.clone();
                let next_steps = next.step_ids();
                let category = next.metadata.failure_category;
                ctx.supersede(&step_id, &plan.plan_id, result);
                let count = ctx.replace_plan(next);

                ctx.record_event(OrchestrationEvent::for_step(
                    OrchestrationEventType::ReplanningTriggered,
                    step_id.clone(),
                    json!({
                        "from_plan": plan.plan_id,
                        "to_plan": next_plan_id,
                        "category": category,
                        "replan_count": count,
                        "steps": next_steps,
                    }),
                ));
                self.metrics.increment_counter(metric_names::REPLANS, 1);
                info!(
                    orchestration_id = %ctx.orchestration_id(),
                    step_id = %step_id,
                    plan_id = %next_plan_id,
                    replan_count = count,
                    "Replanned around failed step"
                );
                Ok(())
            }
            Err(e) => {
                let errors = result.errors.clone();
                ctx.record_result(&step_id, result);
                Err(OrchestratorError::NonRecoverable {
                    step_id,
                    reason: e.to_string(),
                    errors,
                })
            }
        }
    }

    async fn run_collaborative(&self, ctx: &OrchestrationContext) -> Result<(), OrchestratorError> {
        let id = ctx.orchestration_id();
        let plan = ctx.plan();
        let session = self
            .coordinator
            .initiate_collaboration(id, &plan, ctx.constraints());
        ctx.record_event(OrchestrationEvent::new(
            OrchestrationEventType::CoordinationStarted,
            json!({
                "coordination_id": session.coordination_id,
                "type": session.coordination_type,
                "participants": session.participating_agents,
            }),
        ));

        self.run_scheduled(ctx, Schedule::Waves, true).await?;

        let proposal = merge_outputs(&ctx.plan(), &ctx.step_results());
        let strategy = self.config.consensus.strategy();
        let outcome = self
            .coordinator
            .request_consensus(id, proposal, strategy.as_ref())
            .await?;
        ctx.record_event(OrchestrationEvent::new(
            OrchestrationEventType::ConsensusEvaluated,
            json!({
                "reached": outcome.reached,
                "approvals": outcome.approvals,
                "votes": outcome.total_votes,
                "dissenting": outcome.dissenting,
            }),
        ));

        let status = self
            .coordinator
            .wait_for_resolution(
                id,
                self.config.coordination_poll_interval(),
                self.config.coordination_timeout(),
            )
            .await?;
        ctx.set_shared(
            CONSENSUS_KEY,
            json!({
                "status": status,
                "reached": outcome.reached,
                "dissenting": outcome.dissenting,
            }),
        );
        Ok(())
    }

    /// Every step is a competing attempt at the same goal. All attempts are
    /// recorded; the best SUCCESS by score wins, the earliest on a tie.
    async fn run_competitive(&self, ctx: &OrchestrationContext) -> Result<(), OrchestratorError> {
        let plan = ctx.plan();
        let attempts = plan.len();
        let runs = plan.steps.iter().enumerate().map(|(index, step)| {
            let mut inputs = HashMap::new();
            inputs.insert("attempt".to_string(), Value::from(index + 1));
            inputs.insert("competing_attempts".to_string(), Value::from(attempts));
            let request_id = format!("{}-{}", ctx.orchestration_id(), step.step_id);
            let plan = &plan;
            async move {
                let result = self.execute_step(ctx, plan, step, inputs, request_id).await;
                (step, result)
            }
        });
        let outcomes = join_all(runs).await;

        let mut winner: Option<(&PlanStep, &AgentExecutionResult)> = None;
        for (step, result) in &outcomes {
            if !result.is_success() {
                continue;
            }
            match winner {
                Some((_, best)) if result.metrics.success_score <= best.metrics.success_score => {}
                _ => winner = Some((*step, result)),
            }
        }
        let winner = winner.map(|(step, result)| {
            json!({
                "step_id": step.step_id,
                "agent_id": result.agent_id,
                "success_score": result.metrics.success_score,
            })
        });
        let first_step_id = outcomes.first().map(|(step, _)| step.step_id.clone());
        let errors: Vec<ExecutionError> = outcomes
            .iter()
            .flat_map(|(_, result)| result.errors.iter().cloned())
            .collect();

        for (step, result) in outcomes {
            ctx.record_result(&step.step_id, result);
        }

        match winner {
            Some(winner) => {
                info!(
                    orchestration_id = %ctx.orchestration_id(),
                    winner = %winner["step_id"],
                    "Competitive winner selected"
                );
                ctx.set_shared(COMPETITIVE_WINNER_KEY, winner);
                Ok(())
            }
            None => Err(OrchestratorError::StepFailed {
                step_id: first_step_id.unwrap_or_default(),
                errors,
            }),
        }
    }

    /// Bounded debate: every round each step argues concurrently with the
    /// transcript so far, then the participants vote on the successful
    /// positions. Stops at consensus or after the round limit.
    async fn run_debate(&self, ctx: &OrchestrationContext) -> Result<(), OrchestratorError> {
        let id = ctx.orchestration_id();
        let plan = ctx.plan();
        let debate = self
            .coordinator
            .initiate_debate(id, &plan, ctx.constraints());
        ctx.record_event(OrchestrationEvent::new(
            OrchestrationEventType::CoordinationStarted,
            json!({
                "coordination_id": debate.coordination_id,
                "type": "DEBATE",
                "participants": debate.participants,
                "topic": debate.topic,
            }),
        ));

        let strategy = self.config.consensus.strategy();
        let max_rounds = self.config.max_debate_rounds.max(1);
        let mut transcript: Vec<DebateArgument> = Vec::new();
        let mut final_round: Vec<(&PlanStep, AgentExecutionResult)> = Vec::new();
        let mut decision = Value::Null;
        let mut reached = false;
        let mut rounds = 0;

        for round in 1..=max_rounds {
            let transcript_value = serde_json::to_value(&transcript).unwrap_or_default();
            let runs = plan.steps.iter().map(|step| {
                let mut inputs = HashMap::new();
                inputs.insert("debate_round".to_string(), Value::from(round));
                inputs.insert("debate_topic".to_string(), Value::from(debate.topic.clone()));
                inputs.insert("transcript".to_string(), transcript_value.clone());
                let request_id = format!("{}-{}-r{}", id, step.step_id, round);
                let plan = &plan;
                async move {
                    let result = self.execute_step(ctx, plan, step, inputs, request_id).await;
                    (step, result)
                }
            });
            let outcomes = join_all(runs).await;

            if outcomes.iter().all(|(_, result)| result.is_failed()) {
                let step_id = outcomes
                    .first()
                    .map(|(step, _)| step.step_id.clone())
                    .unwrap_or_default();
                let errors: Vec<ExecutionError> = outcomes
                    .iter()
                    .flat_map(|(_, result)| result.errors.iter().cloned())
                    .collect();
                for (step, result) in outcomes {
                    ctx.record_result(&step.step_id, result);
                }
                return Err(OrchestratorError::StepFailed { step_id, errors });
            }

            let arguments: Vec<DebateArgument> = outcomes
                .iter()
                .map(|(step, result)| DebateArgument {
                    round,
                    agent_id: result.agent_id.clone(),
                    step_id: step.step_id.clone(),
                    position: if result.is_failed() {
                        Value::from(result.first_error_message().unwrap_or("failed"))
                    } else {
                        result.output.clone()
                    },
                    success: !result.is_failed(),
                })
                .collect();
            let failed = arguments.iter().filter(|a| !a.success).count();
            self.coordinator.complete_round(id, arguments.clone())?;
            transcript.extend(arguments);
            ctx.record_event(OrchestrationEvent::new(
                OrchestrationEventType::DebateRoundCompleted,
                json!({ "round": round, "arguments": outcomes.len(), "failed": failed }),
            ));

            let proposal: Map<String, Value> = outcomes
                .iter()
                .filter(|(_, result)| !result.is_failed())
                .map(|(step, result)| (step.step_id.clone(), result.output.clone()))
                .collect();
            let outcome = self
                .coordinator
                .request_consensus(id, Value::Object(proposal), strategy.as_ref())
                .await?;
            ctx.record_event(OrchestrationEvent::new(
                OrchestrationEventType::ConsensusEvaluated,
                json!({
                    "round": round,
                    "reached": outcome.reached,
                    "approvals": outcome.approvals,
                    "votes": outcome.total_votes,
                    "dissenting": outcome.dissenting,
                }),
            ));

            rounds = round;
            final_round = outcomes;
            if outcome.reached {
                reached = true;
                decision = outcome.decision;
                break;
            }
        }

        info!(
            orchestration_id = %id,
            rounds,
            consensus = reached,
            "Debate finished"
        );
        for (step, result) in final_round {
            ctx.record_result(&step.step_id, result);
        }
        ctx.set_shared(
            DEBATE_KEY,
            json!({ "rounds": rounds, "consensus_reached": reached, "decision": decision }),
        );
        Ok(())
    }

    /// Evaluate the run and fold every step result into one result
    fn finish(&self, ctx: &OrchestrationContext, started: Instant) -> AgentExecutionResult {
        let plan = ctx.plan();
        let results = ctx.step_results();
        let shared = ctx.shared_context();

        let evaluation = self.evaluator.evaluate(&plan, &results, &shared);
        ctx.record_event(OrchestrationEvent::new(
            OrchestrationEventType::EvaluationCompleted,
            json!({
                "overall_score": evaluation.overall_score,
                "status": evaluation.status,
            }),
        ));

        let ordered = ordered_results(&plan, &results);
        let winner = shared.get(COMPETITIVE_WINNER_KEY).cloned();
        let output = winner
            .as_ref()
            .and_then(|w| w.get("step_id"))
            .and_then(Value::as_str)
            .and_then(|step_id| results.get(step_id))
            .map(|result| result.output.clone())
            .unwrap_or_else(|| merge_outputs(&plan, &results));

        let superseded = ctx.superseded();
        let mut errors: Vec<ExecutionError> = superseded
            .iter()
            .flat_map(|s| s.result.errors.iter().cloned())
            .collect();
        errors.extend(ordered.iter().flat_map(|(_, r)| r.errors.iter().cloned()));

        let metrics = ExecutionMetrics {
            execution_time_ms: started.elapsed().as_millis() as u64,
            tokens_used: ordered.iter().map(|(_, r)| r.metrics.tokens_used).sum(),
            tool_invocations: ordered.iter().map(|(_, r)| r.metrics.tool_invocations).sum(),
            success_score: evaluation.overall_score,
            extra: HashMap::new(),
        };
        let actions_taken: Vec<String> = ordered
            .iter()
            .flat_map(|(_, r)| r.actions_taken.iter().cloned())
            .collect();

        ctx.record_event(OrchestrationEvent::new(
            OrchestrationEventType::OrchestrationCompleted,
            json!({ "status": evaluation.status }),
        ));

        let mut metadata = HashMap::new();
        metadata.insert(
            "orchestration_id".to_string(),
            Value::from(ctx.orchestration_id()),
        );
        metadata.insert("plan_id".to_string(), Value::from(plan.plan_id.clone()));
        metadata.insert(
            "topology".to_string(),
            Value::from(ctx.topology().to_string()),
        );
        metadata.insert("replan_count".to_string(), Value::from(ctx.replan_count()));
        metadata.insert(
            "superseded_steps".to_string(),
            Value::from(
                superseded
                    .iter()
                    .map(|s| s.step_id.clone())
                    .collect::<Vec<_>>(),
            ),
        );
        metadata.insert(
            "superseded".to_string(),
            Value::Array(
                superseded
                    .iter()
                    .map(|s| json!({ "step_id": s.step_id, "plan_id": s.plan_id }))
                    .collect(),
            ),
        );
        metadata.insert(
            "evaluation".to_string(),
            serde_json::to_value(&evaluation).unwrap_or_default(),
        );
        metadata.insert(
            "events".to_string(),
            serde_json::to_value(ctx.events()).unwrap_or_default(),
        );
        if let Some(winner) = winner {
            metadata.insert(COMPETITIVE_WINNER_KEY.to_string(), winner);
        }

        AgentExecutionResult {
            request_id: ctx.orchestration_id().to_string(),
            agent_id: ORCHESTRATOR_AGENT_ID.to_string(),
            status: evaluation.status,
            output,
            actions_taken,
            metrics,
            errors,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Results in plan order, then any result whose step left the plan, by id
fn ordered_results<'a>(
    plan: &ExecutionPlan,
    results: &'a HashMap<String, AgentExecutionResult>,
) -> Vec<(&'a String, &'a AgentExecutionResult)> {
    let mut ordered: Vec<(&String, &AgentExecutionResult)> = plan
        .steps
        .iter()
        .filter_map(|step| results.get_key_value(&step.step_id))
        .collect();
    let mut extra: Vec<(&String, &AgentExecutionResult)> = results
        .iter()
        .filter(|(step_id, _)| !plan.contains_step(step_id))
        .collect();
    extra.sort_by(|a, b| a.0.cmp(b.0));
    ordered.extend(extra);
    ordered
}

/// Object outputs merge key-wise in plan order; any other non-null output is
/// stored under its step id.
pub fn merge_outputs(plan: &ExecutionPlan, results: &HashMap<String, AgentExecutionResult>) -> Value {
    let mut merged = Map::new();
    for (step_id, result) in ordered_results(plan, results) {
        match &result.output {
            Value::Object(fields) => {
                for (key, value) in fields {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                merged.insert(step_id.clone(), other.clone());
            }
        }
    }
    Value::Object(merged)
}
