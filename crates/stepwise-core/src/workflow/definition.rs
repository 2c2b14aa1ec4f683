//! Structural validation of workflow registrations.
//!
//! Runs before a `WorkflowConfig` becomes a `WorkflowDefinition`. Name
//! lookups (actions, conditions) are deliberately *not* checked here: they
//! happen at step time and fail that step.

use std::collections::HashSet;

use stepwise_types::workflow::{ConditionCall, StepKind, StepNode, WorkflowConfig};

use super::error::EngineError;

/// Validate structural constraints on a workflow registration.
///
/// Checks:
/// - Id and name are non-empty; the id has no whitespace
/// - At least one step exists
/// - `timeout_ms`, if set, is > 0
/// - Explicit step ids are unique across the whole step tree
/// - Action/condition/guard names are non-empty
/// - Parallel and loop bodies are non-empty; `max_iterations` >= 1
/// - `output_variable`, if set, is non-empty
pub fn validate_workflow(id: &str, config: &WorkflowConfig) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::definition("workflow id must not be empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(EngineError::definition(format!(
            "workflow id '{id}' must not contain whitespace"
        )));
    }
    if config.name.trim().is_empty() {
        return Err(EngineError::definition(format!(
            "workflow '{id}' must have a name"
        )));
    }
    if config.steps.is_empty() {
        return Err(EngineError::definition(format!(
            "workflow '{id}' must have at least one step"
        )));
    }
    if config.timeout_ms == Some(0) {
        return Err(EngineError::definition(format!(
            "workflow '{id}' timeout must be greater than zero"
        )));
    }
    if let Some(trigger) = &config.trigger {
        if trigger.trigger.trim().is_empty() {
            return Err(EngineError::definition(format!(
                "workflow '{id}' binds an unnamed trigger"
            )));
        }
        if let Some(condition) = &trigger.condition {
            validate_call(condition, "trigger condition")?;
        }
    }

    let mut seen_ids = HashSet::new();
    validate_steps(&config.steps, &mut seen_ids)
}

fn validate_steps<'a>(
    steps: &'a [StepNode],
    seen_ids: &mut HashSet<&'a str>,
) -> Result<(), EngineError> {
    for step in steps {
        validate_step(step, seen_ids)?;
    }
    Ok(())
}

fn validate_step<'a>(
    step: &'a StepNode,
    seen_ids: &mut HashSet<&'a str>,
) -> Result<(), EngineError> {
    if let Some(id) = &step.id {
        if id.trim().is_empty() {
            return Err(EngineError::definition("step id must not be empty"));
        }
        if !seen_ids.insert(id.as_str()) {
            return Err(EngineError::definition(format!("duplicate step id: '{id}'")));
        }
    }
    if let Some(guard) = &step.guard {
        validate_call(guard, "guard")?;
    }
    if step
        .output_variable
        .as_deref()
        .is_some_and(|v| v.trim().is_empty())
    {
        return Err(EngineError::definition(format!(
            "step '{}' has an empty output_variable",
            step.label()
        )));
    }

    match &step.kind {
        StepKind::Action { action, .. } => {
            if action.trim().is_empty() {
                return Err(EngineError::definition("action step must name an action"));
            }
        }
        StepKind::Condition { condition, .. } => {
            if condition.trim().is_empty() {
                return Err(EngineError::definition(
                    "condition step must name a condition",
                ));
            }
        }
        StepKind::Parallel { steps } => {
            if steps.is_empty() {
                return Err(EngineError::definition(format!(
                    "parallel step '{}' has no branches",
                    step.label()
                )));
            }
            validate_steps(steps, seen_ids)?;
        }
        StepKind::Loop {
            while_condition,
            max_iterations,
            steps,
        } => {
            if steps.is_empty() {
                return Err(EngineError::definition(format!(
                    "loop step '{}' has an empty body",
                    step.label()
                )));
            }
            if *max_iterations == Some(0) {
                return Err(EngineError::definition(format!(
                    "loop step '{}' max_iterations must be at least 1",
                    step.label()
                )));
            }
            if let Some(condition) = while_condition {
                validate_call(condition, "loop condition")?;
            }
            validate_steps(steps, seen_ids)?;
        }
        StepKind::Switch { cases, default, .. } => {
            for case in cases {
                validate_steps(&case.steps, seen_ids)?;
            }
            if let Some(default) = default {
                validate_steps(default, seen_ids)?;
            }
        }
    }
    Ok(())
}

fn validate_call(call: &ConditionCall, what: &str) -> Result<(), EngineError> {
    if call.condition.trim().is_empty() {
        return Err(EngineError::definition(format!("{what} must name a condition")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
