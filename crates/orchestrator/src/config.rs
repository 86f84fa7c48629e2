//! Configuration
//!
//! [`OrchestrationConfig`] gathers the tunables of every component. Each
//! section falls back to its defaults, so a file only needs the values it
//! changes:
//!
//! ```yaml
//! circuit_breaker:
//!   failure_threshold: 3
//! orchestrator:
//!   topology: parallel
//!   max_replans: 1
//! telemetry:
//!   format: json
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::coordinator::ConsensusRule;
use crate::engine::EngineConfig;
use crate::evaluator::EvaluationWeights;
use crate::orchestrator::OrchestratorConfig;
use crate::registry::RegistryConfig;
use crate::reliability::CircuitBreakerConfig;
use crate::telemetry::TelemetryConfig;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub registry: RegistryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub engine: EngineConfig,
    pub orchestrator: OrchestratorConfig,
    pub evaluation: EvaluationWeights,
    pub telemetry: TelemetryConfig,
}

impl OrchestrationConfig {
    /// Parse and validate YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: OrchestrationConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&content)?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker
            .validate()
            .map_err(|e| invalid(e.to_string()))?;

        if self.registry.sweep_interval_ms == 0 {
            return Err(invalid("registry.sweep_interval_ms must be greater than 0"));
        }
        if self.registry.heartbeat_timeout_ms == 0 {
            return Err(invalid("registry.heartbeat_timeout_ms must be greater than 0"));
        }
        if self.engine.agent_capacity == 0 {
            return Err(invalid("engine.agent_capacity must be greater than 0"));
        }
        if self.engine.cache_ttl_ms == 0 {
            return Err(invalid("engine.cache_ttl_ms must be greater than 0"));
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.default_constraints.max_execution_time_ms == 0 {
            return Err(invalid(
                "orchestrator.default_constraints.max_execution_time_ms must be greater than 0",
            ));
        }
        if orchestrator.coordination_poll_interval_ms == 0 {
            return Err(invalid(
                "orchestrator.coordination_poll_interval_ms must be greater than 0",
            ));
        }
        if orchestrator.coordination_timeout_ms == 0 {
            return Err(invalid(
                "orchestrator.coordination_timeout_ms must be greater than 0",
            ));
        }
        if orchestrator.max_debate_rounds == 0 {
            return Err(invalid("orchestrator.max_debate_rounds must be greater than 0"));
        }
        if let ConsensusRule::Threshold { ratio } = orchestrator.consensus {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(invalid(format!(
                    "orchestrator.consensus threshold ratio {} must be in (0, 1]",
                    ratio
                )));
            }
        }

        let weights = &self.evaluation;
        let all = [
            weights.correctness,
            weights.completeness,
            weights.quality,
            weights.efficiency,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(invalid("evaluation weights must be non-negative"));
        }
        if (weights.total() - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(invalid(format!(
                "evaluation weights must sum to 1.0, got {}",
                weights.total()
            )));
        }

        Ok(())
    }
}
