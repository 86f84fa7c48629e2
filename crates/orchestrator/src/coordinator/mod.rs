//! Coordinator
//!
//! Tracks multi-agent collaboration and debate sessions. Participants are
//! the registered agents able to serve the plan's steps. Consensus is
//! reached by collecting votes through a [`VoteCollector`] and handing them
//! to a pluggable [`ConsensusStrategy`].

pub mod consensus;

pub use consensus::{
    ConsensusOutcome, ConsensusRule, ConsensusStrategy, MajorityConsensus, ThresholdConsensus,
    UnanimousConsensus, Vote,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::communication::AgentCommunicationBus;
use crate::planner::capabilities_for_agent_type;
use crate::registry::AgentRegistry;
use crate::types::{AgentExecutionRequest, ExecutionConstraints, ExecutionPlan};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Coordination session {coordination_id} not found")]
    SessionNotFound { coordination_id: String },

    #[error("Coordination session {coordination_id} unresolved after {waited_ms}ms")]
    Timeout {
        coordination_id: String,
        waited_ms: u64,
    },

    #[error("Vote collection for session {coordination_id} failed: {message}")]
    Collection {
        coordination_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationType {
    Collaboration,
    Debate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinationStatus {
    InProgress,
    ConsensusReached,
    NoConsensus,
}

impl CoordinationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CoordinationStatus::InProgress)
    }
}

impl std::fmt::Display for CoordinationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationStatus::InProgress => write!(f, "in_progress"),
            CoordinationStatus::ConsensusReached => write!(f, "consensus_reached"),
            CoordinationStatus::NoConsensus => write!(f, "no_consensus"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationSession {
    pub coordination_id: String,
    pub coordination_type: CoordinationType,
    pub participating_agents: Vec<String>,
    pub goal: String,
    pub config: HashMap<String, Value>,
    pub status: CoordinationStatus,
    /// Keyed by step id: `{"agent_id": .., "output": ..}`
    pub contributions: HashMap<String, Value>,
    pub initiated_at: DateTime<Utc>,
}

/// One participant's position in one debate round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateArgument {
    pub round: u32,
    pub agent_id: String,
    pub step_id: String,
    pub position: Value,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateSession {
    pub coordination_id: String,
    pub participants: Vec<String>,
    pub topic: String,
    /// Number of completed rounds
    pub round: u32,
    pub transcript: Vec<DebateArgument>,
}

/// Asks the participants of a session to vote on a proposal
#[async_trait]
pub trait VoteCollector: Send + Sync {
    async fn collect_votes(
        &self,
        session: &CoordinationSession,
        proposal: &Value,
    ) -> anyhow::Result<Vec<Vote>>;
}

/// Collects votes by broadcasting the proposal to every participant.
///
/// An agent approves through `output.approve`; without it, a successful
/// execution counts as approval. Delivery failures count as rejections.
pub struct BusVoteCollector {
    bus: Arc<AgentCommunicationBus>,
    constraints: ExecutionConstraints,
}

impl BusVoteCollector {
    pub fn new(bus: Arc<AgentCommunicationBus>, constraints: ExecutionConstraints) -> Self {
        Self { bus, constraints }
    }
}

#[async_trait]
impl VoteCollector for BusVoteCollector {
    async fn collect_votes(
        &self,
        session: &CoordinationSession,
        proposal: &Value,
    ) -> anyhow::Result<Vec<Vote>> {
        let mut context = HashMap::new();
        context.insert("kind".to_string(), Value::from("vote"));
        context.insert(
            "coordination_id".to_string(),
            Value::from(session.coordination_id.clone()),
        );
        context.insert("proposal".to_string(), proposal.clone());

        let request = AgentExecutionRequest::new(format!("Vote on the proposal for: {}", session.goal))
            .with_request_id(format!("{}-vote", session.coordination_id))
            .with_context(context)
            .with_constraints(self.constraints.clone());

        let outcomes = self
            .bus
            .broadcast(&request, &session.participating_agents)
            .await;

        Ok(outcomes
            .into_iter()
            .map(|outcome| match outcome.result {
                Ok(result) => {
                    let approve = result
                        .output
                        .get("approve")
                        .and_then(Value::as_bool)
                        .unwrap_or_else(|| result.is_success());
                    let rationale = result
                        .output
                        .get("rationale")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Vote::new(outcome.agent_id, approve, rationale)
                        .with_confidence(result.metrics.success_score)
                }
                Err(e) => Vote::reject(outcome.agent_id, e.to_string()),
            })
            .collect())
    }
}

pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    collector: Arc<dyn VoteCollector>,
    sessions: DashMap<String, CoordinationSession>,
    debates: DashMap<String, DebateSession>,
}

impl Coordinator {
    pub fn new(registry: Arc<AgentRegistry>, collector: Arc<dyn VoteCollector>) -> Self {
        Self {
            registry,
            collector,
            sessions: DashMap::new(),
            debates: DashMap::new(),
        }
    }

    /// Available agents able to serve any step of `plan`, in plan order, deduplicated
    fn participants_for(&self, plan: &ExecutionPlan) -> Vec<String> {
        let mut participants: Vec<String> = Vec::new();
        for step in &plan.steps {
            let required = capabilities_for_agent_type(&step.assigned_agent_type);
            for agent in self
                .registry
                .find_available(&step.assigned_agent_type, &required)
            {
                if !participants.contains(&agent.agent_id) {
                    participants.push(agent.agent_id);
                }
            }
        }
        participants
    }

    fn open_session(
        &self,
        coordination_id: &str,
        coordination_type: CoordinationType,
        plan: &ExecutionPlan,
        constraints: &ExecutionConstraints,
    ) -> CoordinationSession {
        let mut config = HashMap::new();
        config.insert(
            "max_execution_time_ms".to_string(),
            Value::from(constraints.max_execution_time_ms),
        );
        config.insert("max_retries".to_string(), Value::from(constraints.max_retries));
        config.insert("plan_id".to_string(), Value::from(plan.plan_id.clone()));
        for (key, value) in &constraints.extra {
            config.insert(key.clone(), value.clone());
        }

        let session = CoordinationSession {
            coordination_id: coordination_id.to_string(),
            coordination_type,
            participating_agents: self.participants_for(plan),
            goal: plan.description.clone(),
            config,
            status: CoordinationStatus::InProgress,
            contributions: HashMap::new(),
            initiated_at: Utc::now(),
        };
        self.sessions
            .insert(coordination_id.to_string(), session.clone());

        info!(
            coordination_id = %coordination_id,
            kind = ?coordination_type,
            participants = session.participating_agents.len(),
            "Coordination session opened"
        );
        session
    }

    pub fn initiate_collaboration(
        &self,
        coordination_id: &str,
        plan: &ExecutionPlan,
        constraints: &ExecutionConstraints,
    ) -> CoordinationSession {
        self.open_session(
            coordination_id,
            CoordinationType::Collaboration,
            plan,
            constraints,
        )
    }

    pub fn initiate_debate(
        &self,
        coordination_id: &str,
        plan: &ExecutionPlan,
        constraints: &ExecutionConstraints,
    ) -> DebateSession {
        let session = self.open_session(coordination_id, CoordinationType::Debate, plan, constraints);
        let debate = DebateSession {
            coordination_id: coordination_id.to_string(),
            participants: session.participating_agents,
            topic: session.goal,
            round: 0,
            transcript: Vec::new(),
        };
        self.debates
            .insert(coordination_id.to_string(), debate.clone());
        debate
    }

    /// Record an agent's output for a step; the agent joins the session if it was not a participant yet
    pub fn record_contribution(
        &self,
        coordination_id: &str,
        step_id: &str,
        agent_id: &str,
        output: Value,
    ) -> Result<(), CoordinationError> {
        let mut session = self.session_mut(coordination_id)?;
        session.contributions.insert(
            step_id.to_string(),
            json!({ "agent_id": agent_id, "output": output }),
        );
        if !session.participating_agents.iter().any(|id| id == agent_id) {
            session.participating_agents.push(agent_id.to_string());
        }
        Ok(())
    }

    /// Append one round of arguments to the transcript; returns the new round count
    pub fn complete_round(
        &self,
        coordination_id: &str,
        arguments: Vec<DebateArgument>,
    ) -> Result<u32, CoordinationError> {
        let mut debate = self
            .debates
            .get_mut(coordination_id)
            .ok_or_else(|| CoordinationError::SessionNotFound {
                coordination_id: coordination_id.to_string(),
            })?;
        debate.round += 1;
        for argument in &arguments {
            if !debate.participants.contains(&argument.agent_id) {
                debate.participants.push(argument.agent_id.clone());
            }
        }
        debate.transcript.extend(arguments);
        debug!(
            coordination_id = %coordination_id,
            round = debate.round,
            transcript = debate.transcript.len(),
            "Debate round recorded"
        );
        let round = debate.round;
        let participants = debate.participants.clone();
        drop(debate);

        // Keep the session's participants in step with the debate
        if let Some(mut session) = self.sessions.get_mut(coordination_id) {
            session.participating_agents = participants;
        }
        Ok(round)
    }

    pub async fn request_consensus(
        &self,
        coordination_id: &str,
        proposal: Value,
        strategy: &dyn ConsensusStrategy,
    ) -> Result<ConsensusOutcome, CoordinationError> {
        let session = self
            .session(coordination_id)
            .ok_or_else(|| CoordinationError::SessionNotFound {
                coordination_id: coordination_id.to_string(),
            })?;

        let votes = self
            .collector
            .collect_votes(&session, &proposal)
            .await
            .map_err(|e| CoordinationError::Collection {
                coordination_id: coordination_id.to_string(),
                message: e.to_string(),
            })?;

        let outcome = strategy.evaluate(&proposal, &votes);
        let status = if outcome.reached {
            CoordinationStatus::ConsensusReached
        } else {
            CoordinationStatus::NoConsensus
        };
        self.session_mut(coordination_id)?.status = status;

        info!(
            coordination_id = %coordination_id,
            strategy = strategy.name(),
            approvals = outcome.approvals,
            votes = outcome.total_votes,
            status = %status,
            "Consensus evaluated"
        );
        Ok(outcome)
    }

    /// Poll until the session leaves IN_PROGRESS or `timeout` passes
    pub async fn wait_for_resolution(
        &self,
        coordination_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<CoordinationStatus, CoordinationError> {
        let started = Instant::now();
        loop {
            let status = self
                .session(coordination_id)
                .map(|session| session.status)
                .ok_or_else(|| CoordinationError::SessionNotFound {
                    coordination_id: coordination_id.to_string(),
                })?;
            if status.is_terminal() {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                warn!(coordination_id = %coordination_id, "Coordination session unresolved");
                return Err(CoordinationError::Timeout {
                    coordination_id: coordination_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn session(&self, coordination_id: &str) -> Option<CoordinationSession> {
        self.sessions.get(coordination_id).map(|s| s.clone())
    }

    pub fn debate(&self, coordination_id: &str) -> Option<DebateSession> {
        self.debates.get(coordination_id).map(|d| d.clone())
    }

    pub fn close_session(&self, coordination_id: &str) -> Option<CoordinationSession> {
        self.debates.remove(coordination_id);
        self.sessions.remove(coordination_id).map(|(_, session)| session)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn session_mut(
        &self,
        coordination_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, CoordinationSession>, CoordinationError>
    {
        self.sessions
            .get_mut(coordination_id)
            .ok_or_else(|| CoordinationError::SessionNotFound {
                coordination_id: coordination_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::InProcessTransport;
    use crate::types::{
        AgentEndpoint, AgentExecutionResult, EndpointType, PlanMetadata, PlanStep,
        PlanningStrategy,
    };

    struct FixedVotes(Vec<bool>);

    #[async_trait]
    impl VoteCollector for FixedVotes {
        async fn collect_votes(
            &self,
            session: &CoordinationSession,
            _proposal: &Value,
        ) -> anyhow::Result<Vec<Vote>> {
            Ok(session
                .participating_agents
                .iter()
                .zip(&self.0)
                .map(|(agent_id, approve)| Vote::new(agent_id.clone(), *approve, "fixed"))
                .collect())
        }
    }

    struct BrokenCollector;

    #[async_trait]
    impl VoteCollector for BrokenCollector {
        async fn collect_votes(
            &self,
            _session: &CoordinationSession,
            _proposal: &Value,
        ) -> anyhow::Result<Vec<Vote>> {
            Err(anyhow::anyhow!("voters unreachable"))
        }
    }

    fn registry_with(agents: &[(&str, &str)]) -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::default());
        for (id, agent_type) in agents {
            registry
                .register(
                    id,
                    id,
                    agent_type,
                    capabilities_for_agent_type(agent_type),
                    AgentEndpoint::in_process(*id),
                    "tenant",
                )
                .expect("valid registration");
        }
        registry
    }

    fn plan() -> ExecutionPlan {
        ExecutionPlan::new(
            "choose a design",
            vec![
                PlanStep::new("s1", "propose", "COMMON_AGENT"),
                PlanStep::new("s2", "critique", "ANALYST_AGENT"),
            ],
            PlanMetadata::new(PlanningStrategy::Simple, 2),
        )
    }

    fn three_agents() -> Arc<AgentRegistry> {
        registry_with(&[
            ("a1", "COMMON_AGENT"),
            ("a2", "COMMON_AGENT"),
            ("a3", "ANALYST_AGENT"),
        ])
    }

    #[tokio::test]
    async fn test_collaboration_reaches_consensus() {
        let coordinator = Coordinator::new(three_agents(), Arc::new(FixedVotes(vec![true, true, false])));
        let session =
            coordinator.initiate_collaboration("c1", &plan(), &ExecutionConstraints::default());
        assert_eq!(session.status, CoordinationStatus::InProgress);
        assert_eq!(session.coordination_type, CoordinationType::Collaboration);
        assert_eq!(session.participating_agents, vec!["a1", "a2", "a3"]);

        let outcome = coordinator
            .request_consensus("c1", json!({"design": "x"}), &MajorityConsensus)
            .await
            .expect("session exists");
        assert!(outcome.reached);
        assert_eq!(outcome.dissenting, vec!["a3".to_string()]);
        assert_eq!(
            coordinator.session("c1").map(|s| s.status),
            Some(CoordinationStatus::ConsensusReached)
        );
    }

    #[tokio::test]
    async fn test_failed_consensus_marks_session() {
        let coordinator = Coordinator::new(three_agents(), Arc::new(FixedVotes(vec![true, false, false])));
        coordinator.initiate_collaboration("c1", &plan(), &ExecutionConstraints::default());

        let outcome = coordinator
            .request_consensus("c1", json!("p"), &UnanimousConsensus)
            .await
            .expect("session exists");
        assert!(!outcome.reached);

        let status = coordinator
            .wait_for_resolution("c1", Duration::from_millis(5), Duration::from_millis(50))
            .await
            .expect("resolved");
        assert_eq!(status, CoordinationStatus::NoConsensus);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let coordinator = Coordinator::new(three_agents(), Arc::new(FixedVotes(vec![])));
        let result = coordinator
            .request_consensus("missing", json!("p"), &MajorityConsensus)
            .await;
        assert!(matches!(
            result,
            Err(CoordinationError::SessionNotFound { .. })
        ));
        assert!(coordinator
            .record_contribution("missing", "s1", "a1", json!(1))
            .is_err());
    }

    #[tokio::test]
    async fn test_collection_failure_surfaces() {
        let coordinator = Coordinator::new(three_agents(), Arc::new(BrokenCollector));
        coordinator.initiate_collaboration("c1", &plan(), &ExecutionConstraints::default());
        let result = coordinator
            .request_consensus("c1", json!("p"), &MajorityConsensus)
            .await;
        assert!(matches!(result, Err(CoordinationError::Collection { .. })));
        assert_eq!(
            coordinator.session("c1").map(|s| s.status),
            Some(CoordinationStatus::InProgress)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_resolution_times_out() {
        let coordinator = Coordinator::new(three_agents(), Arc::new(FixedVotes(vec![])));
        coordinator.initiate_collaboration("c1", &plan(), &ExecutionConstraints::default());
        let result = coordinator
            .wait_for_resolution("c1", Duration::from_millis(10), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(CoordinationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_debate_transcript_and_contributions() {
        let coordinator = Coordinator::new(three_agents(), Arc::new(FixedVotes(vec![])));
        let debate = coordinator.initiate_debate("d1", &plan(), &ExecutionConstraints::default());
        assert_eq!(debate.round, 0);
        assert_eq!(debate.topic, "choose a design");
        assert!(debate.transcript.is_empty());

        let round = coordinator
            .complete_round(
                "d1",
                vec![DebateArgument {
                    round: 1,
                    agent_id: "a1".into(),
                    step_id: "s1".into(),
                    position: json!("yes"),
                    success: true,
                }],
            )
            .expect("debate exists");
        assert_eq!(round, 1);
        assert_eq!(coordinator.debate("d1").map(|d| d.transcript.len()), Some(1));

        coordinator
            .record_contribution("d1", "s1", "outsider", json!({"k": 1}))
            .expect("session exists");
        let session = coordinator.session("d1").expect("session");
        assert!(session.participating_agents.contains(&"outsider".to_string()));
        assert_eq!(session.contributions["s1"]["output"]["k"], 1);

        assert!(coordinator.close_session("d1").is_some());
        assert!(coordinator.debate("d1").is_none());
        assert_eq!(coordinator.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_bus_vote_collector() {
        let registry = registry_with(&[
            ("yes", "COMMON_AGENT"),
            ("no", "COMMON_AGENT"),
        ]);
        let transport = Arc::new(InProcessTransport::new());
        transport.register_handler(
            "yes",
            Arc::new(|req: AgentExecutionRequest| async move {
                Ok::<_, anyhow::Error>(AgentExecutionResult::success(
                    req.request_id,
                    "yes",
                    json!({"approve": true, "rationale": "looks right"}),
                ))
            }),
        );
        transport.register_handler(
            "no",
            Arc::new(|req: AgentExecutionRequest| async move {
                Ok::<_, anyhow::Error>(AgentExecutionResult::success(
                    req.request_id,
                    "no",
                    json!({"approve": false}),
                ))
            }),
        );
        let bus = Arc::new(
            AgentCommunicationBus::new(registry.clone())
                .with_transport(EndpointType::InProcess, transport),
        );
        let collector = BusVoteCollector::new(bus, ExecutionConstraints::default());
        let coordinator = Coordinator::new(registry, Arc::new(collector));
        coordinator.initiate_collaboration("c1", &plan(), &ExecutionConstraints::default());

        let outcome = coordinator
            .request_consensus("c1", json!("p"), &MajorityConsensus)
            .await
            .expect("session exists");
        assert_eq!(outcome.total_votes, 2);
        assert_eq!(outcome.approvals, 1);
        assert!(!outcome.reached);
        assert_eq!(outcome.dissenting, vec!["no".to_string()]);
    }
}
