//! Metrics sink abstraction
//!
//! The core only decides *where* signals are emitted; exporting them is the
//! job of whatever sink the host process injects.

use dashmap::DashMap;
use tracing::debug;

/// Metric names emitted by the orchestration core
pub mod metric_names {
    pub const AGENT_REGISTRATIONS: &str = "orchestrator.registry.registrations";
    pub const AGENT_DEREGISTRATIONS: &str = "orchestrator.registry.deregistrations";
    pub const AGENT_HEARTBEATS: &str = "orchestrator.registry.heartbeats";
    pub const STALE_AGENTS_REMOVED: &str = "orchestrator.registry.stale_removed";
    pub const REGISTERED_AGENTS: &str = "orchestrator.registry.agents";

    pub const EXECUTIONS: &str = "orchestrator.engine.executions";
    pub const EXECUTION_FAILURES: &str = "orchestrator.engine.failures";
    pub const EXECUTION_TIMEOUTS: &str = "orchestrator.engine.timeouts";
    pub const EXECUTION_RETRIES: &str = "orchestrator.engine.retries";
    pub const CACHE_HITS: &str = "orchestrator.engine.cache_hits";
    pub const CIRCUIT_OPEN_REJECTIONS: &str = "orchestrator.engine.circuit_open";
    pub const EXECUTION_DURATION_MS: &str = "orchestrator.engine.duration_ms";

    pub const REPLANS: &str = "orchestrator.replans";
    pub const ORCHESTRATIONS_COMPLETED: &str = "orchestrator.completed";
    pub const ORCHESTRATIONS_FAILED: &str = "orchestrator.failed";
    pub const ORCHESTRATION_DURATION_MS: &str = "orchestrator.duration_ms";
}

/// Receiver for counters, gauges and histograms
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, value: u64);

    fn record_gauge(&self, name: &str, value: f64);

    fn record_histogram(&self, name: &str, value: f64);
}

/// Default sink: every signal becomes a `tracing` debug event
#[derive(Debug, Default, Clone)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn increment_counter(&self, name: &str, value: u64) {
        debug!(metric = name, value, kind = "counter", "metric");
    }

    fn record_gauge(&self, name: &str, value: f64) {
        debug!(metric = name, value, kind = "gauge", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        debug!(metric = name, value, kind = "histogram", "metric");
    }
}

#[derive(Debug, Default, Clone)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment_counter(&self, _name: &str, _value: u64) {}

    fn record_gauge(&self, _name: &str, _value: f64) {}

    fn record_histogram(&self, _name: &str, _value: f64) {}
}

/// Sink that keeps every signal in memory. Handy for tests and debugging.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, Vec<f64>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }

    pub fn histogram(&self, name: &str) -> Vec<f64> {
        self.histograms
            .get(name)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn increment_counter(&self, name: &str, value: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += value;
    }

    fn record_gauge(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    fn record_histogram(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_accumulates() {
        let sink = InMemoryMetricsSink::new();
        sink.increment_counter(metric_names::EXECUTIONS, 1);
        sink.increment_counter(metric_names::EXECUTIONS, 2);
        sink.record_gauge(metric_names::REGISTERED_AGENTS, 4.0);
        sink.record_histogram(metric_names::EXECUTION_DURATION_MS, 12.0);
        sink.record_histogram(metric_names::EXECUTION_DURATION_MS, 30.0);

        assert_eq!(sink.counter(metric_names::EXECUTIONS), 3);
        assert_eq!(sink.counter(metric_names::CACHE_HITS), 0);
        assert_eq!(sink.gauge(metric_names::REGISTERED_AGENTS), Some(4.0));
        assert_eq!(
            sink.histogram(metric_names::EXECUTION_DURATION_MS),
            vec![12.0, 30.0]
        );
    }
}
