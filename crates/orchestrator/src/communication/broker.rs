//! Request/response over an asynchronous message broker
//!
//! Outgoing requests are published to the agent's topic and parked in a
//! pending table keyed by request id. Replies arrive through
//! [`BrokerTransport::complete`]. An entry leaves the table on completion,
//! timeout, or when the waiting caller goes away.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{AgentTransport, TransportError};
use crate::types::{AgentExecutionRequest, AgentExecutionResult, AgentRegistration};

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, request: &AgentExecutionRequest) -> anyhow::Result<()>;
}

type PendingTable = DashMap<String, oneshot::Sender<AgentExecutionResult>>;

pub struct BrokerTransport {
    broker: Arc<dyn MessageBroker>,
    pending: Arc<PendingTable>,
}

struct PendingGuard {
    pending: Arc<PendingTable>,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

impl BrokerTransport {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Deliver a reply. Returns false when nobody is waiting for it any more.
    pub fn complete(&self, response: AgentExecutionResult) -> bool {
        match self.pending.remove(&response.request_id) {
            Some((request_id, sender)) => {
                if sender.send(response).is_err() {
                    debug!(request_id = %request_id, "Caller stopped waiting before reply");
                    return false;
                }
                true
            }
            None => {
                debug!(request_id = %response.request_id, "Uncorrelated broker reply dropped");
                false
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }
}

#[async_trait]
impl AgentTransport for BrokerTransport {
    async fn execute(
        &self,
        agent: &AgentRegistration,
        request: &AgentExecutionRequest,
    ) -> Result<AgentExecutionResult, TransportError> {
        let request_id = request.request_id.clone();
        let (sender, receiver) = oneshot::channel();

        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::DuplicateRequest { request_id });
            }
            Entry::Vacant(slot) => {
                slot.insert(sender);
            }
        }
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            request_id: request_id.clone(),
        };

        if let Err(e) = self.broker.publish(&agent.endpoint.address, request).await {
            warn!(request_id = %request_id, topic = %agent.endpoint.address, error = %e, "Publish failed");
            return Err(TransportError::Broker {
                message: e.to_string(),
            });
        }

        let timeout = request.constraints.max_execution_time();
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(TransportError::ChannelClosed { request_id }),
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    agent_id = %agent.agent_id,
                    timeout_ms = request.constraints.max_execution_time_ms,
                    "No correlated broker reply"
                );
                Err(TransportError::Timeout {
                    request_id,
                    timeout_ms: request.constraints.max_execution_time_ms,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentEndpoint, ExecutionConstraints};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageBroker for RecordingBroker {
        async fn publish(&self, topic: &str, request: &AgentExecutionRequest) -> anyhow::Result<()> {
            self.published
                .lock()
                .push((topic.to_string(), request.request_id.clone()));
            Ok(())
        }
    }

    fn agent() -> AgentRegistration {
        AgentRegistration::new(
            "remote-1",
            "Remote",
            "COMMON_AGENT",
            ["REASONING"],
            AgentEndpoint::broker("agents.remote-1"),
            "t",
        )
    }

    #[tokio::test]
    async fn test_reply_is_correlated_by_request_id() {
        let broker = Arc::new(RecordingBroker::default());
        let transport = Arc::new(BrokerTransport::new(broker.clone()));
        let request = AgentExecutionRequest::new("task").with_request_id("req-7");

        let waiting = {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            tokio::spawn(async move { transport.execute(&agent(), &request).await })
        };

        while !transport.is_pending("req-7") {
            tokio::task::yield_now().await;
        }
        assert!(!transport.complete(AgentExecutionResult::success("other", "remote-1", json!(1))));
        assert!(transport.complete(AgentExecutionResult::success("req-7", "remote-1", json!(2))));

        let result = waiting
            .await
            .expect("task joins")
            .expect("reply delivered");
        assert_eq!(result.output, json!(2));
        assert_eq!(transport.pending_len(), 0);
        assert_eq!(
            broker.published.lock().clone(),
            vec![("agents.remote-1".to_string(), "req-7".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_reply_times_out_and_clears_pending() {
        let transport = BrokerTransport::new(Arc::new(RecordingBroker::default()));
        let request = AgentExecutionRequest::new("task")
            .with_request_id("req-8")
            .with_constraints(ExecutionConstraints::default().with_timeout_ms(20));

        let result = transport.execute(&agent(), &request).await;
        assert_eq!(
            result,
            Err(TransportError::Timeout {
                request_id: "req-8".to_string(),
                timeout_ms: 20
            })
        );
        assert_eq!(transport.pending_len(), 0);
        assert!(!transport.complete(AgentExecutionResult::success("req-8", "remote-1", json!(null))));
    }
}
