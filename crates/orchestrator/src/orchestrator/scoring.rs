//! Agent selection

use std::time::Duration;

use crate::types::AgentRegistration;

/// Higher is better. Availability doubles the score, health (a heartbeat
/// within `heartbeat_timeout`) multiplies it by 1.5, then the success rate
/// and the free share of capacity scale it.
pub fn score_agent(agent: &AgentRegistration, heartbeat_timeout: Duration) -> f64 {
    let mut score = 1.0;
    if agent.is_available() {
        score *= 2.0;
    }
    if agent.is_healthy_within(heartbeat_timeout) {
        score *= 1.5;
    }
    if let Some(success_rate) = agent.success_rate() {
        score *= success_rate;
    }
    if let Some(load) = agent.current_load() {
        score *= 1.0 - load;
    }
    score
}

/// Highest scoring candidate; the first one wins a tie
pub fn select_agent(
    candidates: &[AgentRegistration],
    heartbeat_timeout: Duration,
) -> Option<&AgentRegistration> {
    let mut best: Option<(&AgentRegistration, f64)> = None;
    for candidate in candidates {
        let score = score_agent(candidate, heartbeat_timeout);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(agent, _)| agent)
}
