//! Retry backoff
//!
//! Delay schedules used by the execution engine between attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategies for retry delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between attempts
    None,

    /// Fixed delay between retries
    Fixed { delay_ms: u64 },

    /// Linear backoff: initial + increment * attempt
    Linear { initial_delay_ms: u64, increment_ms: u64 },

    /// Exponential backoff: initial * base^attempt, capped at `max_delay_ms`
    Exponential {
        initial_delay_ms: u64,
        base: f64,
        max_delay_ms: u64,
        jitter: bool,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 100,
            base: 2.0,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl BackoffStrategy {
    /// Calculate delay for given retry number (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,

            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),

            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => Duration::from_millis(
                initial_delay_ms.saturating_add(increment_ms.saturating_mul(attempt as u64)),
            ),

            Self::Exponential {
                initial_delay_ms,
                base,
                max_delay_ms,
                jitter,
            } => {
                let base_delay = *initial_delay_ms as f64 * base.powf(attempt as f64);
                let capped = base_delay.min(*max_delay_ms as f64).max(0.0);
                let delay = Duration::from_millis(capped as u64);

                if *jitter {
                    add_jitter(delay)
                } else {
                    delay
                }
            }
        }
    }
}

/// ±25% random variation
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(0.75..=1.25);
    let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
    Duration::from_millis(jittered_millis)
}
