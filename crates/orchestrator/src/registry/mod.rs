//! Agent Registry
//!
//! Tracks known agents, their capabilities and health, and answers
//! capability-based lookups. A background sweep removes agents whose
//! heartbeat has gone stale.

pub mod store;

pub use store::{AgentStore, InMemoryAgentStore};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::AgentMetricsHook;
use crate::events::{metric_names, MetricsSink, TracingMetricsSink};
use crate::types::{metadata_keys, AgentEndpoint, AgentRegistration, AgentStatus};

/// Weight of the newest outcome in the success-rate moving average
const SUCCESS_RATE_ALPHA: f64 = 0.2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent {agent_id} not found")]
    NotFound { agent_id: String },

    #[error("Invalid registration: {reason}")]
    Validation { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often the staleness sweep runs (milliseconds)
    pub sweep_interval_ms: u64,

    /// Heartbeat age after which an agent is removed (milliseconds)
    pub heartbeat_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

impl RegistryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

pub struct AgentRegistry {
    config: RegistryConfig,
    agents: DashMap<String, AgentRegistration>,
    store: Option<Arc<dyn AgentStore>>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("config", &self.config)
            .field("agents", &self.agents.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            agents: DashMap::new(),
            store: None,
            metrics: Arc::new(TracingMetricsSink),
            shutdown: CancellationToken::new(),
            sweep_task: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn register(
        &self,
        agent_id: &str,
        agent_name: &str,
        agent_type: &str,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        endpoint: AgentEndpoint,
        tenant_id: &str,
    ) -> Result<AgentRegistration, RegistryError> {
        let registration = AgentRegistration::new(
            agent_id,
            agent_name,
            agent_type,
            capabilities,
            endpoint,
            tenant_id,
        );
        self.register_agent(registration)
    }

    /// Register a fully built record. Re-registering an id replaces it.
    pub fn register_agent(
        &self,
        registration: AgentRegistration,
    ) -> Result<AgentRegistration, RegistryError> {
        validate(&registration)?;

        info!(
            agent_id = %registration.agent_id,
            agent_type = %registration.agent_type,
            capabilities = ?registration.capabilities,
            endpoint = %registration.endpoint.endpoint_type,
            "Agent registered"
        );
        self.agents
            .insert(registration.agent_id.clone(), registration.clone());

        self.metrics
            .increment_counter(metric_names::AGENT_REGISTRATIONS, 1);
        self.metrics
            .record_gauge(metric_names::REGISTERED_AGENTS, self.agents.len() as f64);

        if let Some(store) = self.store.clone() {
            let record = registration.clone();
            self.persist("save_agent", async move { store.save_agent(&record).await });
        }

        Ok(registration)
    }

    pub fn deregister(&self, agent_id: &str) -> Result<AgentRegistration, RegistryError> {
        let (_, removed) = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| not_found(agent_id))?;

        info!(agent_id, "Agent deregistered");
        self.metrics
            .increment_counter(metric_names::AGENT_DEREGISTRATIONS, 1);
        self.metrics
            .record_gauge(metric_names::REGISTERED_AGENTS, self.agents.len() as f64);

        if let Some(store) = self.store.clone() {
            let id = agent_id.to_string();
            self.persist("delete_agent", async move { store.delete_agent(&id).await });
        }

        Ok(removed)
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<(), RegistryError> {
        let now = Utc::now();
        {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| not_found(agent_id))?;
            entry.last_heartbeat = now;
        }

        debug!(agent_id, "Heartbeat received");
        self.metrics
            .increment_counter(metric_names::AGENT_HEARTBEATS, 1);

        if let Some(store) = self.store.clone() {
            let id = agent_id.to_string();
            self.persist("update_heartbeat", async move {
                store.update_heartbeat(&id, now).await
            });
        }
        Ok(())
    }

    pub fn update_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), RegistryError> {
        let previous = {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| not_found(agent_id))?;
            std::mem::replace(&mut entry.status, status)
        };

        if previous != status {
            info!(agent_id, from = %previous, to = %status, "Agent status changed");
        }

        if let Some(store) = self.store.clone() {
            let id = agent_id.to_string();
            self.persist("update_status", async move {
                store.update_status(&id, status).await
            });
        }
        Ok(())
    }

    /// Agents that are AVAILABLE, healthy, of a matching type and carry every
    /// required capability. Ordered by registration time.
    pub fn find_available(
        &self,
        agent_type: &str,
        required_capabilities: &[String],
    ) -> Vec<AgentRegistration> {
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let mut matches: Vec<AgentRegistration> = self
            .agents
            .iter()
            .filter(|entry| {
                let agent = entry.value();
                agent.is_available()
                    && agent.is_healthy_within(heartbeat_timeout)
                    && agent.matches_type(agent_type)
                    && agent.has_capabilities(required_capabilities)
            })
            .map(|entry| entry.value().clone())
            .collect();

        sort_by_registration(&mut matches);
        debug!(
            agent_type,
            required = ?required_capabilities,
            found = matches.len(),
            "Agent lookup"
        );
        matches
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn list_all(&self, tenant_id: &str) -> Vec<AgentRegistration> {
        let mut agents: Vec<AgentRegistration> = self
            .agents
            .iter()
            .filter(|entry| entry.value().tenant_id() == Some(tenant_id))
            .map(|entry| entry.value().clone())
            .collect();
        sort_by_registration(&mut agents);
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Fold one execution outcome into the agent's `successRate` and set its `currentLoad`.
    pub fn record_execution_outcome(&self, agent_id: &str, success: bool, current_load: f64) {
        let Some(mut entry) = self.agents.get_mut(agent_id) else {
            debug!(agent_id, "Outcome for unknown agent ignored");
            return;
        };

        let previous = entry.success_rate().unwrap_or(1.0);
        let observed = if success { 1.0 } else { 0.0 };
        let rate = (1.0 - SUCCESS_RATE_ALPHA) * previous + SUCCESS_RATE_ALPHA * observed;

        entry
            .metadata
            .insert(metadata_keys::SUCCESS_RATE.to_string(), Value::from(rate));
        entry.metadata.insert(
            metadata_keys::CURRENT_LOAD.to_string(),
            Value::from(current_load.clamp(0.0, 1.0)),
        );
    }

    /// Remove every agent whose heartbeat is older than the timeout. Returns the removed ids.
    pub fn sweep_stale(&self) -> Vec<String> {
        let timeout = self.config.heartbeat_timeout();
        let now = Utc::now();

        let stale: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| entry.value().is_stale(timeout, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for agent_id in stale {
            // A heartbeat may have landed since the scan.
            match self
                .agents
                .remove_if(&agent_id, |_, agent| agent.is_stale(timeout, Utc::now()))
            {
                Some(_) => {
                    warn!(agent_id = %agent_id, "Removed stale agent");
                    if let Some(store) = self.store.clone() {
                        let id = agent_id.clone();
                        self.persist("delete_agent", async move { store.delete_agent(&id).await });
                    }
                    removed.push(agent_id);
                }
                None => debug!(agent_id = %agent_id, "Stale agent refreshed before removal"),
            }
        }

        if !removed.is_empty() {
            self.metrics
                .increment_counter(metric_names::STALE_AGENTS_REMOVED, removed.len() as u64);
            self.metrics
                .record_gauge(metric_names::REGISTERED_AGENTS, self.agents.len() as f64);
        }
        removed
    }

    /// Start the periodic staleness sweep. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.sweep_task.lock();
        if task.is_some() {
            return;
        }

        let registry = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = self.config.sweep_interval();
        info!(sweep_interval_ms = self.config.sweep_interval_ms, "Starting agent registry sweep");

        *task = Some(tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval_timer.tick() => {
                        let removed = registry.sweep_stale();
                        if !removed.is_empty() {
                            debug!(count = removed.len(), "Sweep finished");
                        }
                    }
                }
            }
            debug!("Agent registry sweep stopped");
        }));
    }

    /// Stop the sweep task and wait for it to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweep_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Agent registry sweep task ended abnormally");
            }
        }
        info!("Agent registry shut down");
    }

    fn persist<F>(&self, operation: &'static str, call: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = call.await {
                        warn!(operation, error = %e, "Agent persistence failed");
                    }
                });
            }
            Err(_) => debug!(operation, "No runtime available, persistence skipped"),
        }
    }
}

impl AgentMetricsHook for AgentRegistry {
    fn record_outcome(&self, agent_id: &str, success: bool, current_load: f64) {
        self.record_execution_outcome(agent_id, success, current_load);
    }
}

fn validate(registration: &AgentRegistration) -> Result<(), RegistryError> {
    let required = [
        ("agent_id", registration.agent_id.as_str()),
        ("agent_name", registration.agent_name.as_str()),
        ("agent_type", registration.agent_type.as_str()),
        ("endpoint address", registration.endpoint.address.as_str()),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(RegistryError::Validation {
                reason: format!("{} must not be empty", field),
            });
        }
    }
    Ok(())
}

fn not_found(agent_id: &str) -> RegistryError {
    RegistryError::NotFound {
        agent_id: agent_id.to_string(),
    }
}

fn sort_by_registration(agents: &mut [AgentRegistration]) {
    agents.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
}
