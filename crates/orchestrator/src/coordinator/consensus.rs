//! Consensus strategies
//!
//! A strategy turns a set of votes on a proposal into a decision. The
//! coordinator does not care how; it only needs `reached`, the decision and
//! who dissented.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One participant's vote on a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    pub approve: bool,
    pub rationale: String,
    pub confidence: Option<f64>,
}

impl Vote {
    pub fn new(agent_id: impl Into<String>, approve: bool, rationale: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            approve,
            rationale: rationale.into(),
            confidence: None,
        }
    }

    pub fn approve(agent_id: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self::new(agent_id, true, rationale)
    }

    pub fn reject(agent_id: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self::new(agent_id, false, rationale)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub reached: bool,
    /// The accepted proposal, or null when consensus was not reached
    pub decision: Value,
    pub dissenting: Vec<String>,
    pub approvals: usize,
    pub total_votes: usize,
}

pub trait ConsensusStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, proposal: &Value, votes: &[Vote]) -> ConsensusOutcome;
}

fn tally(proposal: &Value, votes: &[Vote], reached: impl Fn(usize, usize) -> bool) -> ConsensusOutcome {
    let approvals = votes.iter().filter(|v| v.approve).count();
    let total_votes = votes.len();
    let reached = total_votes > 0 && reached(approvals, total_votes);
    ConsensusOutcome {
        reached,
        decision: if reached { proposal.clone() } else { Value::Null },
        dissenting: votes
            .iter()
            .filter(|v| !v.approve)
            .map(|v| v.agent_id.clone())
            .collect(),
        approvals,
        total_votes,
    }
}

/// More than half must approve
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityConsensus;

impl ConsensusStrategy for MajorityConsensus {
    fn name(&self) -> &str {
        "majority"
    }

    fn evaluate(&self, proposal: &Value, votes: &[Vote]) -> ConsensusOutcome {
        tally(proposal, votes, |approvals, total| approvals > total / 2)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnanimousConsensus;

impl ConsensusStrategy for UnanimousConsensus {
    fn name(&self) -> &str {
        "unanimous"
    }

    fn evaluate(&self, proposal: &Value, votes: &[Vote]) -> ConsensusOutcome {
        tally(proposal, votes, |approvals, total| approvals == total)
    }
}

/// At least `ratio` of the votes must approve
#[derive(Debug, Clone, Copy)]
pub struct ThresholdConsensus {
    ratio: f64,
}

impl ThresholdConsensus {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl ConsensusStrategy for ThresholdConsensus {
    fn name(&self) -> &str {
        "threshold"
    }

    fn evaluate(&self, proposal: &Value, votes: &[Vote]) -> ConsensusOutcome {
        let ratio = self.ratio;
        tally(proposal, votes, move |approvals, total| {
            let required = (total as f64 * ratio).ceil() as usize;
            approvals >= required.max(1)
        })
    }
}

/// Configurable choice of strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsensusRule {
    #[default]
    Majority,
    Unanimous,
    Threshold { ratio: f64 },
}

impl ConsensusRule {
    pub fn strategy(&self) -> Arc<dyn ConsensusStrategy> {
        match self {
            ConsensusRule::Majority => Arc::new(MajorityConsensus),
            ConsensusRule::Unanimous => Arc::new(UnanimousConsensus),
            ConsensusRule::Threshold { ratio } => Arc::new(ThresholdConsensus::new(*ratio)),
        }
    }
}

impl std::fmt::Display for ConsensusRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusRule::Majority => write!(f, "majority"),
            ConsensusRule::Unanimous => write!(f, "unanimous"),
            ConsensusRule::Threshold { ratio } => write!(f, "threshold({})", ratio),
        }
    }
}
