//! Shared per-instance state.
//!
//! An `InstanceSlot` owns the instance record plus the two resources that
//! must be released exactly once when the instance settles: the timeout
//! timer and the concurrency permit. Whichever path settles first (step
//! completion, failure, timeout, stop, shutdown) wins; later attempts see a
//! terminal status and do nothing.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use stepwise_types::instance::{InstanceStatus, StepRecord, StepStatus, WorkflowInstance};
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

struct SlotState {
    record: WorkflowInstance,
    timer: Option<AbortHandle>,
    permit: Option<OwnedSemaphorePermit>,
}

/// Live state of one workflow instance.
pub struct InstanceSlot {
    state: Mutex<SlotState>,
    /// Cancelled once the instance settles; the step runner checks it
    /// between steps.
    stop: CancellationToken,
    /// Cancelled by the timer task when the instance's budget runs out.
    deadline: CancellationToken,
}

impl InstanceSlot {
    pub fn new(record: WorkflowInstance, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                record,
                timer: None,
                permit,
            }),
            stop: CancellationToken::new(),
            deadline: CancellationToken::new(),
        }
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn deadline_token(&self) -> &CancellationToken {
        &self.deadline
    }

    /// Whether the run should halt at its next step boundary: the instance
    /// settled, or its deadline passed.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled() || self.deadline.is_cancelled()
    }

    /// Copy of the current record.
    pub async fn snapshot(&self) -> WorkflowInstance {
        self.state.lock().await.record.clone()
    }

    pub async fn status(&self) -> InstanceStatus {
        self.state.lock().await.record.status
    }

    /// Whether the timeout timer is still armed.
    pub async fn timer_armed(&self) -> bool {
        self.state.lock().await.timer.is_some()
    }

    /// Spawn the timeout timer. Must be called from within a tokio runtime.
    pub async fn arm_timer(&self, after: Duration) {
        let deadline = self.deadline.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            deadline.cancel();
        })
        .abort_handle();

        let mut state = self.state.lock().await;
        if state.record.status.is_terminal() {
            handle.abort();
            return;
        }
        if let Some(previous) = state.timer.replace(handle) {
            previous.abort();
        }
        state.record.timer_active = true;
    }

    pub async fn set_current_step(&self, index: usize) {
        self.state.lock().await.record.current_step_index = index;
    }

    /// Append a record and return its position in the history.
    pub async fn push_step(&self, record: StepRecord) -> usize {
        let mut state = self.state.lock().await;
        state.record.steps.push(record);
        state.record.steps.len() - 1
    }

    pub async fn count_attempt(&self, position: usize) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.record.steps.get_mut(position) {
            record.attempts += 1;
        }
    }

    /// Settle the record at `position`.
    ///
    /// Returns `false` when the record was already settled, e.g. marked
    /// interrupted by a timeout while its action was in flight.
    pub async fn finish_step(
        &self,
        position: usize,
        status: StepStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().await;
        match state.record.steps.get_mut(position) {
            Some(record) if !record.is_settled() => {
                record.status = status;
                record.output = output;
                record.error = error;
                record.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Transition from running to a terminal status, releasing the timer and
    /// the concurrency permit.
    ///
    /// Returns the settled record, or `None` if the instance had already
    /// settled.
    pub async fn settle(
        &self,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Option<WorkflowInstance> {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock().await;
        if state.record.status.is_terminal() {
            return None;
        }

        state.record.status = status;
        state.record.completed_at = Some(Utc::now());
        state.record.error = error;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.record.timer_active = false;
        state.permit = None;

        if status == InstanceStatus::Failed {
            let now = Utc::now();
            let reason = state
                .record
                .error
                .clone()
                .unwrap_or_else(|| "instance failed".to_string());
            for step in state.record.steps.iter_mut().filter(|s| !s.is_settled()) {
                step.status = StepStatus::Failed;
                step.error = Some(format!("interrupted: {reason}"));
                step.completed_at = Some(now);
            }
        }
        self.stop.cancel();

        Some(state.record.clone())
    }
}

impl std::fmt::Debug for InstanceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSlot")
            .field("stop_requested", &self.stop.is_cancelled())
            .field("deadline_passed", &self.deadline.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
