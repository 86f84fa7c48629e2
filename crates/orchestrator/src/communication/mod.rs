//! Agent Communication Bus
//!
//! Routes a request to an agent through the transport registered for the
//! agent's endpoint kind. Transports are pluggable; the crate ships an
//! in-process transport and a broker transport with request/response
//! correlation.

pub mod broker;
pub mod in_process;

pub use broker::{BrokerTransport, MessageBroker};
pub use in_process::{InProcessTransport, LocalAgent};

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::AgentRegistry;
use crate::types::{
    error_codes, AgentExecutionRequest, AgentExecutionResult, AgentRegistration, EndpointType,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("No transport registered for endpoint type {endpoint_type}")]
    UnsupportedEndpoint { endpoint_type: EndpointType },

    #[error("Recipient {agent_id} is not reachable")]
    UnknownRecipient { agent_id: String },

    #[error("Request {request_id} is already awaiting a response")]
    DuplicateRequest { request_id: String },

    #[error("Agent {agent_id} failed: {message}")]
    Agent { agent_id: String, message: String },

    #[error("Broker error: {message}")]
    Broker { message: String },

    #[error("Response channel for request {request_id} closed")]
    ChannelClosed { request_id: String },
}

impl TransportError {
    /// Error code recorded on execution results
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Timeout { .. } => error_codes::TIMEOUT,
            TransportError::Agent { .. } => error_codes::AGENT_ERROR,
            _ => error_codes::TRANSPORT_ERROR,
        }
    }
}

/// Reaches agents of one endpoint kind
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn execute(
        &self,
        agent: &AgentRegistration,
        request: &AgentExecutionRequest,
    ) -> Result<AgentExecutionResult, TransportError>;
}

/// Outcome of one recipient of a broadcast
#[derive(Debug, Clone)]
pub struct BroadcastOutcome {
    pub agent_id: String,
    pub result: Result<AgentExecutionResult, TransportError>,
}

pub struct AgentCommunicationBus {
    registry: Arc<AgentRegistry>,
    transports: HashMap<EndpointType, Arc<dyn AgentTransport>>,
}

impl AgentCommunicationBus {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            transports: HashMap::new(),
        }
    }

    pub fn with_transport(
        mut self,
        endpoint_type: EndpointType,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        self.transports.insert(endpoint_type, transport);
        self
    }

    pub fn supports(&self, endpoint_type: EndpointType) -> bool {
        self.transports.contains_key(&endpoint_type)
    }

    pub async fn send(
        &self,
        agent: &AgentRegistration,
        request: &AgentExecutionRequest,
    ) -> Result<AgentExecutionResult, TransportError> {
        let endpoint_type = agent.endpoint.endpoint_type;
        let transport = self
            .transports
            .get(&endpoint_type)
            .ok_or(TransportError::UnsupportedEndpoint { endpoint_type })?;

        debug!(
            agent_id = %agent.agent_id,
            request_id = %request.request_id,
            endpoint = %endpoint_type,
            "Dispatching request"
        );
        transport.execute(agent, request).await
    }

    /// Send `request` to every recipient concurrently. Each recipient gets its
    /// own request id (`{request_id}:{agent_id}`) and is bounded by the
    /// request's execution time limit. Completes once every send has finished.
    pub async fn broadcast(
        &self,
        request: &AgentExecutionRequest,
        recipient_ids: &[String],
    ) -> Vec<BroadcastOutcome> {
        let timeout = request.constraints.max_execution_time();

        let sends = recipient_ids.iter().map(|agent_id| async move {
            let result = match self.registry.get(agent_id) {
                Some(agent) => {
                    let mut addressed = request.clone();
                    addressed.request_id = format!("{}:{}", request.request_id, agent_id);
                    match tokio::time::timeout(timeout, self.send(&agent, &addressed)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout {
                            request_id: addressed.request_id.clone(),
                            timeout_ms: request.constraints.max_execution_time_ms,
                        }),
                    }
                }
                None => Err(TransportError::UnknownRecipient {
                    agent_id: agent_id.clone(),
                }),
            };

            if let Err(e) = &result {
                warn!(agent_id = %agent_id, error = %e, "Broadcast delivery failed");
            }
            BroadcastOutcome {
                agent_id: agent_id.clone(),
                result,
            }
        });

        join_all(sends).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentEndpoint;
    use serde_json::json;

    fn bus_with_echo() -> (Arc<AgentRegistry>, AgentCommunicationBus) {
        let registry = Arc::new(AgentRegistry::default());
        let transport = Arc::new(InProcessTransport::new());
        for id in ["a", "b"] {
            registry
                .register(
                    id,
                    id,
                    "COMMON_AGENT",
                    ["REASONING"],
                    AgentEndpoint::in_process(id),
                    "t",
                )
                .expect("valid registration");
            let name = id.to_string();
            transport.register_handler(
                id,
                Arc::new(move |req: AgentExecutionRequest| {
                    let name = name.clone();
                    async move {
                        Ok::<_, anyhow::Error>(AgentExecutionResult::success(
                            req.request_id,
                            name,
                            json!({"task": req.task}),
                        ))
                    }
                }),
            );
        }
        let bus = AgentCommunicationBus::new(registry.clone())
            .with_transport(EndpointType::InProcess, transport);
        (registry, bus)
    }

    #[tokio::test]
    async fn test_send_without_transport_is_unsupported() {
        let registry = Arc::new(AgentRegistry::default());
        let agent = registry
            .register(
                "r",
                "r",
                "COMMON_AGENT",
                ["REASONING"],
                AgentEndpoint::rpc("http://r"),
                "t",
            )
            .expect("valid registration");
        let bus = AgentCommunicationBus::new(registry);

        let result = bus.send(&agent, &AgentExecutionRequest::new("x")).await;
        assert_eq!(
            result,
            Err(TransportError::UnsupportedEndpoint {
                endpoint_type: EndpointType::Rpc
            })
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_despite_failures() {
        let (_registry, bus) = bus_with_echo();
        let request = AgentExecutionRequest::new("vote").with_request_id("req");
        let recipients = vec!["a".to_string(), "ghost".to_string(), "b".to_string()];

        let outcomes = bus.broadcast(&request, &recipients).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[0].result.as_ref().map(|r| r.request_id.clone()),
            Ok("req:a".to_string())
        );
        assert!(matches!(
            outcomes[1].result,
            Err(TransportError::UnknownRecipient { .. })
        ));
        assert!(outcomes[2].result.is_ok());
    }

    #[test]
    fn test_error_codes() {
        let timeout = TransportError::Timeout {
            request_id: "r".into(),
            timeout_ms: 1,
        };
        assert_eq!(timeout.code(), error_codes::TIMEOUT);
        let broker = TransportError::Broker {
            message: "down".into(),
        };
        assert_eq!(broker.code(), error_codes::TRANSPORT_ERROR);
    }
}
