//! Configuration types.

use std::time::Duration;

use crate::tasks::model::PollFrequency;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine name for identification.
    pub name: String,
    /// Scheduler tick resolution.
    pub tick_interval: Duration,
    /// Poll frequency assigned to tasks created without an explicit choice.
    pub default_poll_frequency: PollFrequency,
    /// How many execution-log lines the API returns by default.
    pub log_tail: usize,
    /// Maximum tasks stepped concurrently across the whole engine.
    pub max_concurrent_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "taskpilot".to_string(),
            tick_interval: Duration::from_secs(1),
            default_poll_frequency: PollFrequency::preset_5m(),
            log_tail: 50,
            max_concurrent_steps: 8,
        }
    }
}
