//! Configuration types for Stepwise.
//!
//! `StepwiseConfig` represents the top-level `stepwise.toml`: an `[engine]`
//! table plus trigger declarations. All fields have sensible defaults.

use serde::{Deserialize, Serialize};

use crate::workflow::DEFAULT_MAX_ITERATIONS;

/// Engine tuning knobs, injected into `Engine::new`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on simultaneously running instances.
    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,

    /// Timeout applied when a workflow does not declare one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Iteration cap for loops without `max_iterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Age after which terminal instances are eligible for cleanup.
    #[serde(default = "default_instance_retention_ms")]
    pub instance_retention_ms: u64,
}

fn default_max_concurrent_instances() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_event_capacity() -> usize {
    1024
}

fn default_instance_retention_ms() -> u64 {
    3_600_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: default_max_concurrent_instances(),
            default_timeout_ms: default_timeout_ms(),
            default_max_iterations: default_max_iterations(),
            event_capacity: default_event_capacity(),
            instance_retention_ms: default_instance_retention_ms(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent_instances(mut self, max: usize) -> Self {
        self.max_concurrent_instances = max;
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Clamp values that would make the engine unusable.
    pub fn validated(mut self) -> Self {
        self.max_concurrent_instances = self.max_concurrent_instances.max(1);
        self.default_max_iterations = self.default_max_iterations.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self
    }
}

/// A trigger definition declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerDeclaration {
    pub name: String,
    pub events: Vec<String>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepwiseConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub triggers: Vec<TriggerDeclaration>,
}
