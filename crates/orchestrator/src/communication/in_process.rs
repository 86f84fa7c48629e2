//! In-process agents

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use super::{AgentTransport, TransportError};
use crate::types::{AgentExecutionRequest, AgentExecutionResult, AgentRegistration};

/// An agent implemented inside this process
#[async_trait]
pub trait LocalAgent: Send + Sync {
    async fn handle(&self, request: AgentExecutionRequest) -> anyhow::Result<AgentExecutionResult>;
}

#[async_trait]
impl<F, Fut> LocalAgent for F
where
    F: Fn(AgentExecutionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AgentExecutionResult>> + Send + 'static,
{
    async fn handle(&self, request: AgentExecutionRequest) -> anyhow::Result<AgentExecutionResult> {
        (self)(request).await
    }
}

/// Dispatches to [`LocalAgent`] handlers keyed by endpoint address
#[derive(Default)]
pub struct InProcessTransport {
    handlers: DashMap<String, Arc<dyn LocalAgent>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, address: impl Into<String>, handler: Arc<dyn LocalAgent>) {
        self.handlers.insert(address.into(), handler);
    }

    pub fn remove_handler(&self, address: &str) -> bool {
        self.handlers.remove(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl AgentTransport for InProcessTransport {
    async fn execute(
        &self,
        agent: &AgentRegistration,
        request: &AgentExecutionRequest,
    ) -> Result<AgentExecutionResult, TransportError> {
        let handler = self
            .handlers
            .get(&agent.endpoint.address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::UnknownRecipient {
                agent_id: agent.agent_id.clone(),
            })?;

        let started = Instant::now();
        let mut result =
            handler
                .handle(request.clone())
                .await
                .map_err(|e| TransportError::Agent {
                    agent_id: agent.agent_id.clone(),
                    message: e.to_string(),
                })?;

        result.request_id = request.request_id.clone();
        result.agent_id = agent.agent_id.clone();
        if result.metrics.execution_time_ms == 0 {
            result.metrics.execution_time_ms = started.elapsed().as_millis() as u64;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentEndpoint;
    use serde_json::json;

    fn agent(address: &str) -> AgentRegistration {
        AgentRegistration::new(
            "agent-1",
            "Agent",
            "COMMON_AGENT",
            ["REASONING"],
            AgentEndpoint::in_process(address),
            "t",
        )
    }

    #[tokio::test]
    async fn test_handler_result_is_stamped() {
        let transport = InProcessTransport::new();
        transport.register_handler(
            "local",
            Arc::new(|_req: AgentExecutionRequest| async {
                Ok::<_, anyhow::Error>(AgentExecutionResult::success("", "", json!("done")))
            }),
        );

        let request = AgentExecutionRequest::new("task").with_request_id("req-1");
        let result = transport
            .execute(&agent("local"), &request)
            .await
            .expect("handler succeeds");
        assert_eq!(result.request_id, "req-1");
        assert_eq!(result.agent_id, "agent-1");
        assert_eq!(result.output, json!("done"));
    }

    #[tokio::test]
    async fn test_handler_error_maps_to_agent_error() {
        let transport = InProcessTransport::new();
        transport.register_handler(
            "local",
            Arc::new(|_req: AgentExecutionRequest| async {
                Err::<AgentExecutionResult, _>(anyhow::anyhow!("model unavailable"))
            }),
        );

        let result = transport
            .execute(&agent("local"), &AgentExecutionRequest::new("task"))
            .await;
        assert_eq!(
            result,
            Err(TransportError::Agent {
                agent_id: "agent-1".to_string(),
                message: "model unavailable".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let transport = InProcessTransport::new();
        let result = transport
            .execute(&agent("nowhere"), &AgentExecutionRequest::new("task"))
            .await;
        assert!(matches!(
            result,
            Err(TransportError::UnknownRecipient { .. })
        ));
    }
}
