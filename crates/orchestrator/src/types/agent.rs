//! Agent registration records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Agent type that matches every request, and request type that accepts every agent.
pub const WILDCARD_AGENT_TYPE: &str = "ANY";

/// Heartbeat age after which an agent is no longer considered healthy.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Well-known metadata keys
pub mod metadata_keys {
    pub const TENANT_ID: &str = "tenantId";
    pub const SUCCESS_RATE: &str = "successRate";
    pub const CURRENT_LOAD: &str = "currentLoad";
}

/// Lifecycle status of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Available,
    Busy,
    Unavailable,
    Draining,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Available => write!(f, "available"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Unavailable => write!(f, "unavailable"),
            AgentStatus::Draining => write!(f, "draining"),
        }
    }
}

/// Transport kind used to reach an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointType {
    /// Synchronous request/response call
    Rpc,
    /// Request/response correlated over an asynchronous message broker
    Broker,
    /// Handler living in the same process
    InProcess,
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointType::Rpc => write!(f, "rpc"),
            EndpointType::Broker => write!(f, "broker"),
            EndpointType::InProcess => write!(f, "in-process"),
        }
    }
}

/// Where an agent can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub endpoint_type: EndpointType,
    pub address: String,
}

impl AgentEndpoint {
    pub fn new(endpoint_type: EndpointType, address: impl Into<String>) -> Self {
        Self {
            endpoint_type,
            address: address.into(),
        }
    }

    pub fn in_process(address: impl Into<String>) -> Self {
        Self::new(EndpointType::InProcess, address)
    }

    pub fn broker(topic: impl Into<String>) -> Self {
        Self::new(EndpointType::Broker, topic)
    }

    pub fn rpc(address: impl Into<String>) -> Self {
        Self::new(EndpointType::Rpc, address)
    }
}

/// A registered agent. Identity is `agent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub endpoint: AgentEndpoint,
    pub metadata: HashMap<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        endpoint: AgentEndpoint,
        tenant_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut metadata = HashMap::new();
        metadata.insert(
            metadata_keys::TENANT_ID.to_string(),
            Value::String(tenant_id.into()),
        );
        metadata.insert(metadata_keys::SUCCESS_RATE.to_string(), Value::from(1.0));
        metadata.insert(metadata_keys::CURRENT_LOAD.to_string(), Value::from(0.0));

        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Available,
            endpoint,
            metadata,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Available
    }

    /// Healthy means reachable (not UNAVAILABLE) with a fresh heartbeat.
    pub fn is_healthy(&self) -> bool {
        self.is_healthy_within(DEFAULT_HEARTBEAT_TIMEOUT)
    }

    pub fn is_healthy_within(&self, heartbeat_timeout: Duration) -> bool {
        self.status != AgentStatus::Unavailable && !self.is_stale(heartbeat_timeout, Utc::now())
    }

    pub fn is_stale(&self, heartbeat_timeout: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        match chrono::Duration::from_std(heartbeat_timeout) {
            Ok(timeout) => age > timeout,
            Err(_) => false,
        }
    }

    /// Case-insensitive type match honoring the `ANY` wildcard on either side.
    pub fn matches_type(&self, requested: &str) -> bool {
        requested.eq_ignore_ascii_case(WILDCARD_AGENT_TYPE)
            || self.agent_type.eq_ignore_ascii_case(WILDCARD_AGENT_TYPE)
            || self.agent_type.eq_ignore_ascii_case(requested)
    }

    pub fn has_capabilities<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required
            .into_iter()
            .all(|capability| self.capabilities.contains(capability))
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::TENANT_ID)
            .and_then(Value::as_str)
    }

    pub fn success_rate(&self) -> Option<f64> {
        self.metadata
            .get(metadata_keys::SUCCESS_RATE)
            .and_then(Value::as_f64)
    }

    pub fn current_load(&self) -> Option<f64> {
        self.metadata
            .get(metadata_keys::CURRENT_LOAD)
            .and_then(Value::as_f64)
    }
}
