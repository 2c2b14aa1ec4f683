//! Execution tracking types: instances, step records, filters, and stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::StepType;

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
///
/// `Running` is the only non-terminal state; terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Outcome of a single attempted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Recorded at step start, replaced when the step settles.
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One entry of an instance's step history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    /// Position of the step within its enclosing sequence.
    pub index: usize,
    /// Dotted index path from the root, e.g. `2.i3.0` for the first child
    /// of the fourth iteration of top-level step 2.
    pub path: String,
    /// Nesting depth (0 for top-level steps).
    pub depth: usize,
    /// Loop iteration (1-based) when recorded inside a loop body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// Step label (id, action/condition name, or kind).
    pub step: String,
    pub step_type: StepType,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of action invocations (retries included).
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn is_settled(&self) -> bool {
        self.status != StepStatus::Running
    }
}

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// One execution run of a workflow.
///
/// Mutated only by the step executor and the engine; removed only by an
/// explicit cleanup pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Index of the top-level step currently (or last) executing.
    pub current_step_index: usize,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the instance's timeout timer is still armed.
    pub timer_active: bool,
    /// Trigger that launched the instance, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl WorkflowInstance {
    pub fn new(id: Uuid, workflow_id: impl Into<String>, trigger: Option<String>) -> Self {
        Self {
            id,
            workflow_id: workflow_id.into(),
            status: InstanceStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            current_step_index: 0,
            steps: Vec::new(),
            error: None,
            timer_active: false,
            trigger,
        }
    }

    /// Wall-clock duration, if the instance has settled.
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at.map(|end| {
            (end - self.started_at).num_milliseconds().max(0) as u64
        })
    }
}

// ---------------------------------------------------------------------------
// Filters / results / stats
// ---------------------------------------------------------------------------

/// Filters for listing instances. All fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    /// Keep only the most recent `limit` instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.workflow_id
            .as_deref()
            .is_none_or(|id| instance.workflow_id == id)
            && self.status.is_none_or(|s| instance.status == s)
    }
}

/// What a successful `execute_workflow` call resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub status: InstanceStatus,
    /// Every attempted step, in record order.
    pub steps: Vec<StepRecord>,
    /// Final context data.
    pub data: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Aggregate execution counters for one engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStats {
    pub total_executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub stopped: u64,
    /// Subset of `failed` that settled by timeout.
    pub timed_out: u64,
    pub running: usize,
    /// Mean duration of completed and failed instances.
    pub average_duration_ms: u64,
    pub registered_workflows: usize,
    pub registered_actions: usize,
    pub registered_conditions: usize,
    pub registered_triggers: usize,
}
