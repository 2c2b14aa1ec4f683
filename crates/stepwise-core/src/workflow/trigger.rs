//! Event-name listeners that launch bound workflows.
//!
//! `TriggerBinder` maps external event names to the workflows bound to them.
//! Binding a workflow subscribes one listener per event the named trigger
//! declares. Delivery evaluates the optional guard condition against the
//! event payload and, if satisfied, runs the workflow. Dispatch errors are
//! logged and never returned to the event source.

use dashmap::DashMap;
use serde_json::Value;
use stepwise_types::workflow::{ConditionCall, TriggerBinding};

use super::context::{ExecutionContext, TriggerOrigin};
use super::executor::{Engine, ExecuteOptions};
use super::registry::TriggerDefinition;

/// One workflow listening on one event name.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerListener {
    pub workflow_id: String,
    pub trigger: String,
    pub condition: Option<ConditionCall>,
}

/// Event name -> listeners table.
#[derive(Debug, Default)]
pub struct TriggerBinder {
    listeners: DashMap<String, Vec<TriggerListener>>,
}

impl TriggerBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `workflow_id` to every event of `definition`.
    ///
    /// Replaces any listeners the workflow already had.
    pub fn bind(&self, workflow_id: &str, binding: &TriggerBinding, definition: &TriggerDefinition) {
        self.unbind(workflow_id);
        for event in &definition.events {
            self.listeners
                .entry(event.clone())
                .or_default()
                .push(TriggerListener {
                    workflow_id: workflow_id.to_string(),
                    trigger: binding.trigger.clone(),
                    condition: binding.condition.clone(),
                });
        }
        tracing::info!(
            workflow_id,
            trigger = %binding.trigger,
            events = definition.events.len(),
            "bound workflow trigger"
        );
    }

    /// Drop every listener of `workflow_id`. Returns how many were removed.
    pub fn unbind(&self, workflow_id: &str) -> usize {
        let mut removed = 0;
        self.listeners.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|l| l.workflow_id != workflow_id);
            removed += before - listeners.len();
            !listeners.is_empty()
        });
        if removed > 0 {
            tracing::debug!(workflow_id, removed, "unbound workflow trigger");
        }
        removed
    }

    /// Listeners subscribed to `event`, in binding order.
    pub fn listeners_for(&self, event: &str) -> Vec<TriggerListener> {
        self.listeners
            .get(event)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Total number of listeners across all events.
    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }

    /// Sorted event names with at least one listener.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Deliver one event to one listener.
///
/// Builds the invocation context from the payload, checks the guard, and runs
/// the workflow. Never fails: every error is logged.
pub(crate) async fn deliver(engine: Engine, listener: TriggerListener, event: String, payload: Value) {
    let ctx = ExecutionContext::from_value(payload).with_trigger(TriggerOrigin {
        trigger: listener.trigger.clone(),
        event: event.clone(),
    });

    if let Some(condition) = &listener.condition {
        match engine.registry().check(condition, &ctx).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    workflow_id = %listener.workflow_id,
                    event = %event,
                    "trigger condition not met"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    workflow_id = %listener.workflow_id,
                    event = %event,
                    error = %e,
                    "trigger condition failed"
                );
                return;
            }
        }
    }

    match engine
        .execute_workflow(&listener.workflow_id, ctx, ExecuteOptions::default())
        .await
    {
        Ok(result) => tracing::info!(
            workflow_id = %listener.workflow_id,
            instance_id = %result.instance_id,
            event = %event,
            "triggered workflow completed"
        ),
        Err(e) => tracing::warn!(
            workflow_id = %listener.workflow_id,
            event = %event,
            error = %e,
            "triggered workflow failed"
        ),
    }
}
