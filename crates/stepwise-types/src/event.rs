//! Lifecycle events broadcast by the engine.
//!
//! `EngineEvent` is the stable contract consumed by logging, metrics, and
//! notification collaborators. All variants are Clone + Send + Sync for use
//! with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::StepType;

/// Events emitted during workflow registration and execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow was registered or replaced.
    WorkflowRegistered {
        workflow_id: String,
        name: String,
        version: u32,
    },

    /// An instance was admitted and started.
    WorkflowStarted {
        workflow_id: String,
        instance_id: Uuid,
        trigger: Option<String>,
    },

    /// A step began executing.
    StepStarted {
        workflow_id: String,
        instance_id: Uuid,
        path: String,
        step: String,
        step_type: StepType,
    },

    /// A step settled successfully (or was skipped by its guard).
    StepCompleted {
        workflow_id: String,
        instance_id: Uuid,
        path: String,
        step: String,
        duration_ms: u64,
        skipped: bool,
    },

    /// A step failed.
    StepFailed {
        workflow_id: String,
        instance_id: Uuid,
        path: String,
        step: String,
        error: String,
        /// Whether the failure aborts the enclosing sequence.
        critical: bool,
    },

    /// An instance completed.
    WorkflowCompleted {
        workflow_id: String,
        instance_id: Uuid,
        duration_ms: u64,
        steps: usize,
    },

    /// An instance failed (critical step failure or timeout).
    WorkflowFailed {
        workflow_id: String,
        instance_id: Uuid,
        error: String,
        timed_out: bool,
    },

    /// An instance was stopped.
    WorkflowStopped {
        workflow_id: String,
        instance_id: Uuid,
        reason: String,
    },

    /// The engine shut down.
    Shutdown { stopped_instances: usize },
}

impl EngineEvent {
    /// Stable kebab-case event name.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::WorkflowRegistered { .. } => "workflow-registered",
            EngineEvent::WorkflowStarted { .. } => "workflow-started",
            EngineEvent::StepStarted { .. } => "step-started",
            EngineEvent::StepCompleted { .. } => "step-completed",
            EngineEvent::StepFailed { .. } => "step-failed",
            EngineEvent::WorkflowCompleted { .. } => "workflow-completed",
            EngineEvent::WorkflowFailed { .. } => "workflow-failed",
            EngineEvent::WorkflowStopped { .. } => "workflow-stopped",
            EngineEvent::Shutdown { .. } => "shutdown",
        }
    }

    /// The instance this event belongs to, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::WorkflowStarted { instance_id, .. }
            | EngineEvent::StepStarted { instance_id, .. }
            | EngineEvent::StepCompleted { instance_id, .. }
            | EngineEvent::StepFailed { instance_id, .. }
            | EngineEvent::WorkflowCompleted { instance_id, .. }
            | EngineEvent::WorkflowFailed { instance_id, .. }
            | EngineEvent::WorkflowStopped { instance_id, .. } => Some(*instance_id),
            EngineEvent::WorkflowRegistered { .. } | EngineEvent::Shutdown { .. } => None,
        }
    }

    /// Whether this event marks the end of an instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::WorkflowCompleted { .. }
                | EngineEvent::WorkflowFailed { .. }
                | EngineEvent::WorkflowStopped { .. }
        )
    }
}
