//! Error taxonomy surfaced by the engine's public operations.

use stepwise_types::instance::InstanceStatus;
use thiserror::Error;
use uuid::Uuid;

/// The kind of registered thing a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Workflow,
    Action,
    Condition,
    Trigger,
    Instance,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Workflow => "workflow",
            ResourceKind::Action => "action",
            ResourceKind::Condition => "condition",
            ResourceKind::Trigger => "trigger",
            ResourceKind::Instance => "instance",
        };
        f.write_str(s)
    }
}

/// Errors returned by `Engine` and `Registry` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or duplicate registration.
    #[error("definition error: {0}")]
    Definition(String),

    /// Unknown workflow, action, condition, trigger, or instance.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// The workflow exists but is disabled.
    #[error("workflow '{0}' is disabled")]
    WorkflowDisabled(String),

    /// The running-instance bound is already reached.
    #[error("concurrency limit reached ({max} running instances)")]
    ConcurrencyLimit { max: usize },

    /// The instance exceeded its wall-clock budget.
    #[error("workflow '{workflow_id}' instance {instance_id} timed out after {timeout_ms}ms")]
    Timeout {
        workflow_id: String,
        instance_id: Uuid,
        timeout_ms: u64,
    },

    /// A critical step failed and aborted the instance.
    #[error(
        "workflow '{workflow_id}' instance {instance_id} failed at step {step_index} ('{step}' at {path}): {message}"
    )]
    StepExecution {
        workflow_id: String,
        instance_id: Uuid,
        step_index: usize,
        path: String,
        step: String,
        message: String,
    },

    /// The instance was stopped before it finished.
    #[error("workflow '{workflow_id}' instance {instance_id} stopped: {reason}")]
    Stopped {
        workflow_id: String,
        instance_id: Uuid,
        reason: String,
    },

    /// The operation requires a running instance.
    #[error("instance {instance_id} is {status}, not running")]
    InvalidState {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    /// The engine has been shut down.
    #[error("engine is shut down")]
    ShuttingDown,
}

impl EngineError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn definition(message: impl Into<String>) -> Self {
        EngineError::Definition(message.into())
    }

    /// The instance this error is about, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            EngineError::Timeout { instance_id, .. }
            | EngineError::StepExecution { instance_id, .. }
            | EngineError::Stopped { instance_id, .. }
            | EngineError::InvalidState { instance_id, .. } => Some(*instance_id),
            _ => None,
        }
    }
}
