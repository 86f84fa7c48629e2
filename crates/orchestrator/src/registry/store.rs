//! Registration persistence
//!
//! The registry's in-memory map is authoritative. Stores only mirror it, and
//! their calls run detached from the request path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{AgentRegistration, AgentStatus};

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn save_agent(&self, registration: &AgentRegistration) -> anyhow::Result<()>;

    async fn delete_agent(&self, agent_id: &str) -> anyhow::Result<()>;

    async fn update_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn update_status(&self, agent_id: &str, status: AgentStatus) -> anyhow::Result<()>;
}

/// Store that keeps registrations in a map. Useful for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryAgentStore {
    agents: DashMap<String, AgentRegistration>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.get(agent_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn save_agent(&self, registration: &AgentRegistration) -> anyhow::Result<()> {
        self.agents
            .insert(registration.agent_id.clone(), registration.clone());
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> anyhow::Result<()> {
        self.agents.remove(agent_id);
        Ok(())
    }

    async fn update_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        match self.agents.get_mut(agent_id) {
            Some(mut entry) => {
                entry.last_heartbeat = at;
                Ok(())
            }
            None => anyhow::bail!("agent {} is not persisted", agent_id),
        }
    }

    async fn update_status(&self, agent_id: &str, status: AgentStatus) -> anyhow::Result<()> {
        match self.agents.get_mut(agent_id) {
            Some(mut entry) => {
                entry.status = status;
                Ok(())
            }
            None => anyhow::bail!("agent {} is not persisted", agent_id),
        }
    }
}
