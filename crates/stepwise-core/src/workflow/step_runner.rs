//! Step interpreter.
//!
//! Walks a step tree against an instance's context. Action and condition
//! steps dispatch to the [`Registry`]; parallel, loop, and switch steps
//! recurse. Every attempted step gets exactly one record in the instance
//! history, reserved as `Running` when the step starts and settled in place.
//!
//! Stop is cooperative: the stop token is checked before each step, at each
//! loop iteration, and between retry attempts. An action already in flight
//! always runs to completion.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use stepwise_types::event::EngineEvent;
use stepwise_types::instance::{StepRecord, StepStatus};
use stepwise_types::workflow::{ConditionCall, StepKind, StepNode, SwitchCase};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::instance::InstanceSlot;
use super::registry::Registry;
use super::retry::RetryHandler;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Scope / region
// ---------------------------------------------------------------------------

/// Everything a step needs to know about the instance it runs in.
pub(crate) struct RunScope {
    pub workflow_id: String,
    pub instance_id: Uuid,
    pub instance: Arc<InstanceSlot>,
    pub context: ExecutionContext,
    pub retry_attempts: u32,
    pub max_iterations: u32,
}

/// Position of a sequential region inside the step tree.
#[derive(Debug, Clone, Default)]
pub(crate) struct Region {
    prefix: Option<String>,
    depth: usize,
    iteration: Option<u32>,
    /// Index of the enclosing top-level step.
    root: Option<usize>,
}

impl Region {
    pub fn root() -> Self {
        Self::default()
    }

    fn path(&self, index: usize) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{index}"),
            None => index.to_string(),
        }
    }

    fn nested(&self, prefix: String, index: usize, iteration: Option<u32>) -> Self {
        Self {
            prefix: Some(prefix),
            depth: self.depth + 1,
            iteration,
            root: Some(self.root.unwrap_or(index)),
        }
    }

    /// Region for the children of the step at `index` / `path`.
    fn children(&self, path: &str, index: usize) -> Self {
        self.nested(path.to_string(), index, self.iteration)
    }

    /// Region for loop iteration `n` (1-based).
    fn iteration(&self, path: &str, index: usize, n: u32) -> Self {
        self.nested(format!("{path}.i{n}"), index, Some(n))
    }

    /// Region for a named switch branch.
    fn branch(&self, path: &str, index: usize, branch: &str) -> Self {
        self.nested(format!("{path}.{branch}"), index, self.iteration)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A critical failure travelling up to the instance boundary.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StepFailure {
    /// Index of the top-level step the failure happened under.
    pub step_index: usize,
    pub path: String,
    pub step: String,
    pub message: String,
}

/// Why a sequence ended early.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepError {
    Failed(StepFailure),
    Stopped,
}

/// How a single step settled when it did not abort its sequence.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepOutcome {
    Completed(Value),
    Skipped,
    /// Non-critical failure, recorded and stepped over.
    Failed(String),
}

impl StepOutcome {
    /// Entry in a nested region's result array.
    fn into_value(self) -> Value {
        match self {
            StepOutcome::Completed(output) => output,
            StepOutcome::Skipped => Value::Null,
            StepOutcome::Failed(message) => json!({ "error": message }),
        }
    }
}

/// Result of running the kind-specific part of a step.
enum KindError {
    Failed {
        message: String,
        /// Innermost critical failure when the error came from a child.
        cause: Option<StepFailure>,
        /// Partial output worth keeping on the record.
        output: Option<Value>,
    },
    Stopped,
}

impl KindError {
    fn failed(message: impl Into<String>) -> Self {
        KindError::Failed {
            message: message.into(),
            cause: None,
            output: None,
        }
    }
}

impl From<StepError> for KindError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Stopped => KindError::Stopped,
            StepError::Failed(failure) => KindError::Failed {
                message: failure.message.clone(),
                cause: Some(failure),
                output: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Interprets step trees for every instance of one engine.
#[derive(Debug, Clone)]
pub(crate) struct StepRunner {
    registry: Arc<Registry>,
    events: EventBus,
}

impl StepRunner {
    pub fn new(registry: Arc<Registry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    /// Run `steps` in declaration order.
    ///
    /// Returns one entry per step: the output, `null` for a skipped step, or
    /// `{"error": ..}` for a non-critical failure.
    pub async fn run_sequence(
        &self,
        steps: &[StepNode],
        scope: &RunScope,
        region: &Region,
    ) -> Result<Vec<Value>, StepError> {
        let mut outputs = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            if scope.instance.is_stop_requested() {
                return Err(StepError::Stopped);
            }
            if region.depth == 0 {
                scope.instance.set_current_step(index).await;
            }
            let outcome = self.run_step(step, index, scope, region).await?;
            outputs.push(outcome.into_value());
        }
        Ok(outputs)
    }

    fn run_step<'a>(
        &'a self,
        step: &'a StepNode,
        index: usize,
        scope: &'a RunScope,
        region: &'a Region,
    ) -> BoxFuture<'a, Result<StepOutcome, StepError>> {
        Box::pin(async move {
            let path = region.path(index);
            let label = step.label();

            let guard = match &step.guard {
                Some(guard) => self.registry.check(guard, &scope.context).await.map_err(|e| e.to_string()),
                None => Ok(true),
            };
            if guard == Ok(false) {
                self.record_skip(step, index, &path, &label, scope, region).await;
                return Ok(StepOutcome::Skipped);
            }

            let started = Instant::now();
            let position = self.begin(step, index, &path, &label, scope, region).await;

            let result = match guard {
                Err(message) => Err(KindError::failed(format!("guard failed: {message}"))),
                Ok(_) => self.run_kind(step, index, &path, position, scope, region).await,
            };

            match result {
                Ok(output) => {
                    if let Some(variable) = &step.output_variable {
                        scope.context.set(variable.clone(), output.clone()).await;
                    }
                    let recorded = scope
                        .instance
                        .finish_step(position, StepStatus::Completed, Some(output.clone()), None)
                        .await;
                    if recorded {
                        self.events.publish(EngineEvent::StepCompleted {
                            workflow_id: scope.workflow_id.clone(),
                            instance_id: scope.instance_id,
                            path,
                            step: label,
                            duration_ms: started.elapsed().as_millis() as u64,
                            skipped: false,
                        });
                    }
                    Ok(StepOutcome::Completed(output))
                }
                Err(KindError::Stopped) => {
                    scope
                        .instance
                        .finish_step(
                            position,
                            StepStatus::Failed,
                            None,
                            Some("instance stopped".to_string()),
                        )
                        .await;
                    Err(StepError::Stopped)
                }
                Err(KindError::Failed {
                    message,
                    cause,
                    output,
                }) => {
                    let recorded = scope
                        .instance
                        .finish_step(position, StepStatus::Failed, output, Some(message.clone()))
                        .await;
                    if recorded {
                        self.events.publish(EngineEvent::StepFailed {
                            workflow_id: scope.workflow_id.clone(),
                            instance_id: scope.instance_id,
                            path: path.clone(),
                            step: label.clone(),
                            error: message.clone(),
                            critical: step.critical,
                        });
                    }
                    tracing::warn!(
                        workflow_id = %scope.workflow_id,
                        instance_id = %scope.instance_id,
                        step = %label,
                        path = %path,
                        critical = step.critical,
                        error = %message,
                        "step failed"
                    );

                    if step.critical {
                        Err(StepError::Failed(cause.unwrap_or(StepFailure {
                            step_index: region.root.unwrap_or(index),
                            path,
                            step: label,
                            message,
                        })))
                    } else {
                        Ok(StepOutcome::Failed(message))
                    }
                }
            }
        })
    }

    async fn run_kind(
        &self,
        step: &StepNode,
        index: usize,
        path: &str,
        position: usize,
        scope: &RunScope,
        region: &Region,
    ) -> Result<Value, KindError> {
        match &step.kind {
            StepKind::Action { action, params } => {
                self.run_action(action, params, position, scope).await
            }
            StepKind::Condition { condition, params } => {
                let call = ConditionCall::new(condition.clone(), params.clone());
                self.registry
                    .check(&call, &scope.context)
                    .await
                    .map(Value::Bool)
                    .map_err(|e| KindError::failed(e.to_string()))
            }
            StepKind::Parallel { steps } => {
                self.run_parallel(steps, &region.children(path, index), scope)
                    .await
            }
            StepKind::Loop {
                while_condition,
                max_iterations,
                steps,
            } => {
                let cap = max_iterations.unwrap_or(scope.max_iterations).max(1);
                self.run_loop(while_condition.as_ref(), cap, steps, index, path, scope, region)
                    .await
            }
            StepKind::Switch {
                value,
                cases,
                default,
            } => {
                self.run_switch(value, cases, default.as_deref(), index, path, scope, region)
                    .await
            }
        }
    }

    async fn run_action(
        &self,
        name: &str,
        params: &Value,
        position: usize,
        scope: &RunScope,
    ) -> Result<Value, KindError> {
        let Some(action) = self.registry.action(name) else {
            return Err(KindError::failed(format!("action not found: {name}")));
        };
        let params = scope.context.resolve(params).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            scope.instance.count_attempt(position).await;
            match action.execute(&scope.context, params.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if RetryHandler::should_retry(scope.retry_attempts, attempt) => {
                    if scope.instance.is_stop_requested() {
                        return Err(KindError::Stopped);
                    }
                    tracing::debug!(
                        instance_id = %scope.instance_id,
                        action = name,
                        attempt,
                        error = %e,
                        "retrying action"
                    );
                }
                Err(e) => return Err(KindError::failed(e.to_string())),
            }
        }
    }

    async fn run_parallel(
        &self,
        steps: &[StepNode],
        region: &Region,
        scope: &RunScope,
    ) -> Result<Value, KindError> {
        let branches = steps
            .iter()
            .enumerate()
            .map(|(k, child)| self.run_step(child, k, scope, region));
        let outcomes = join_all(branches).await;

        let mut stopped = false;
        let mut cause = None;
        let mut failures = 0;
        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let entry = match outcome {
                Ok(StepOutcome::Completed(output)) => json!({ "status": "completed", "output": output }),
                Ok(StepOutcome::Skipped) => json!({ "status": "skipped" }),
                Ok(StepOutcome::Failed(message)) => json!({ "status": "failed", "error": message }),
                Err(StepError::Failed(failure)) => {
                    failures += 1;
                    let entry = json!({ "status": "failed", "error": failure.message });
                    cause.get_or_insert(failure);
                    entry
                }
                Err(StepError::Stopped) => {
                    stopped = true;
                    json!({ "status": "stopped" })
                }
            };
            results.push(entry);
        }

        if stopped {
            return Err(KindError::Stopped);
        }
        if failures > 0 {
            return Err(KindError::Failed {
                message: format!("{failures} of {} parallel branches failed", steps.len()),
                cause,
                output: Some(Value::Array(results)),
            });
        }
        Ok(Value::Array(results))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        condition: Option<&ConditionCall>,
        cap: u32,
        steps: &[StepNode],
        index: usize,
        path: &str,
        scope: &RunScope,
        region: &Region,
    ) -> Result<Value, KindError> {
        let mut iterations = 0u32;
        let mut capped = false;
        let mut results = Vec::new();

        loop {
            match condition {
                Some(call) => match self.registry.check(call, &scope.context).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        return Err(KindError::Failed {
                            message: format!("loop condition failed: {e}"),
                            cause: None,
                            output: Some(loop_output(iterations, capped, results)),
                        });
                    }
                },
                None if iterations == 1 => break,
                None => {}
            }
            if iterations == cap {
                capped = true;
                tracing::warn!(
                    instance_id = %scope.instance_id,
                    path,
                    max_iterations = cap,
                    "loop reached its iteration cap"
                );
                break;
            }

            tokio::task::yield_now().await;
            if scope.instance.is_stop_requested() {
                return Err(KindError::Stopped);
            }
            iterations += 1;
            tracing::debug!(instance_id = %scope.instance_id, path, iteration = iterations, "loop iteration");

            let iteration = region.iteration(path, index, iterations);
            match self.run_sequence(steps, scope, &iteration).await {
                Ok(outputs) => results.push(Value::Array(outputs)),
                Err(StepError::Stopped) => return Err(KindError::Stopped),
                Err(StepError::Failed(failure)) => {
                    return Err(KindError::Failed {
                        message: failure.message.clone(),
                        cause: Some(failure),
                        output: Some(loop_output(iterations, capped, results)),
                    });
                }
            }
        }

        Ok(loop_output(iterations, capped, results))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_switch(
        &self,
        value: &Value,
        cases: &[SwitchCase],
        default: Option<&[StepNode]>,
        index: usize,
        path: &str,
        scope: &RunScope,
        region: &Region,
    ) -> Result<Value, KindError> {
        let input = scope.context.resolve(value).await;

        if let Some((k, case)) = cases.iter().enumerate().find(|(_, case)| case.matches(&input)) {
            let branch = region.branch(path, index, &format!("c{k}"));
            let results = self.run_sequence(&case.steps, scope, &branch).await?;
            return Ok(json!({
                "matched": true,
                "case": k,
                "value": input,
                "results": results,
            }));
        }

        match default {
            Some(steps) => {
                let branch = region.branch(path, index, "default");
                let results = self.run_sequence(steps, scope, &branch).await?;
                Ok(json!({ "matched": false, "default": true, "results": results }))
            }
            None => Ok(json!({ "matched": false })),
        }
    }

    /// Reserve a running record and announce the step.
    async fn begin(
        &self,
        step: &StepNode,
        index: usize,
        path: &str,
        label: &str,
        scope: &RunScope,
        region: &Region,
    ) -> usize {
        tracing::debug!(instance_id = %scope.instance_id, step = label, path, "step started");
        let position = scope
            .instance
            .push_step(new_record(step, index, path, label, region, StepStatus::Running))
            .await;
        self.events.publish(EngineEvent::StepStarted {
            workflow_id: scope.workflow_id.clone(),
            instance_id: scope.instance_id,
            path: path.to_string(),
            step: label.to_string(),
            step_type: step.step_type(),
        });
        position
    }

    async fn record_skip(
        &self,
        step: &StepNode,
        index: usize,
        path: &str,
        label: &str,
        scope: &RunScope,
        region: &Region,
    ) {
        tracing::debug!(instance_id = %scope.instance_id, step = label, path, "guard false, step skipped");
        let mut record = new_record(step, index, path, label, region, StepStatus::Skipped);
        record.completed_at = Some(record.started_at);
        scope.instance.push_step(record).await;
        self.events.publish(EngineEvent::StepCompleted {
            workflow_id: scope.workflow_id.clone(),
            instance_id: scope.instance_id,
            path: path.to_string(),
            step: label.to_string(),
            duration_ms: 0,
            skipped: true,
        });
    }
}

fn new_record(
    step: &StepNode,
    index: usize,
    path: &str,
    label: &str,
    region: &Region,
    status: StepStatus,
) -> StepRecord {
    StepRecord {
        index,
        path: path.to_string(),
        depth: region.depth,
        iteration: region.iteration,
        step: label.to_string(),
        step_type: step.step_type(),
        status,
        output: None,
        error: None,
        attempts: 0,
        started_at: Utc::now(),
        completed_at: None,
    }
}

fn loop_output(iterations: u32, capped: bool, results: Vec<Value>) -> Value {
    json!({
        "iterations": iterations,
        "capped": capped,
        "results": results,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
