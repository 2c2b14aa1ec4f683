//! `Engine`: workflow registration and instance supervision.
//!
//! The engine owns the workflow table, the instance table, the admission
//! semaphore, and the trigger binder. Each admitted instance gets a tracked
//! supervisor task that runs the step sequence as a second tracked task and
//! races it against the instance timer and the stop token. The caller of
//! `execute_workflow` only awaits the supervisor, so dropping the call never
//! leaves an instance unsettled:
//!
//! - run finishes first: the run task settles the instance itself
//! - timer fires first: the instance settles as failed (timed out)
//! - stop wins: `stop_workflow` / `shutdown` already settled it
//!
//! Settling is first-wins (see [`InstanceSlot::settle`]); only the path that
//! actually settles updates stats and emits the lifecycle event. A run that
//! lost the race keeps going until its next step boundary, where it sees the
//! stop token and halts. In-flight actions are never interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::event::EngineEvent;
use stepwise_types::instance::{
    EngineStats, ExecutionResult, InstanceFilter, InstanceStatus, WorkflowInstance,
};
use stepwise_types::workflow::{TriggerBinding, WorkflowConfig, WorkflowDefinition};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::definition::validate_workflow;
use super::error::{EngineError, ResourceKind};
use super::instance::InstanceSlot;
use super::registry::{ActionDefinition, ConditionDefinition, Registry, TriggerDefinition};
use super::step_runner::{Region, RunScope, StepError, StepRunner};
use super::trigger::{self, TriggerBinder};
use crate::event::EventBus;

/// Per-call overrides for [`Engine::execute_workflow`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Replaces the workflow's timeout for this invocation.
    pub timeout_ms: Option<u64>,
}

impl ExecuteOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicU64,
    timed_out: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_samples: AtomicU64,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<Registry>,
    workflows: DashMap<String, Arc<WorkflowDefinition>>,
    instances: DashMap<Uuid, Arc<InstanceSlot>>,
    admission: Arc<Semaphore>,
    events: EventBus,
    counters: Counters,
    triggers: TriggerBinder,
    tasks: TaskTracker,
    runner: StepRunner,
    shutting_down: AtomicBool,
}

enum Race {
    Finished(Result<Result<ExecutionResult, EngineError>, JoinError>),
    TimedOut,
    Halted,
}

/// The workflow engine.
///
/// Cheap to clone; clones share all state. Construct one per owner; there
/// is no process-wide instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine with its own empty registry.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, Arc::new(Registry::new()))
    }

    /// Create an engine around an existing registry.
    pub fn with_registry(config: EngineConfig, registry: Arc<Registry>) -> Self {
        let config = config.validated();
        let events = EventBus::new(config.event_capacity);
        let runner = StepRunner::new(registry.clone(), events.clone());
        Self {
            inner: Arc::new(EngineInner {
                admission: Arc::new(Semaphore::new(config.max_concurrent_instances)),
                config,
                registry,
                workflows: DashMap::new(),
                instances: DashMap::new(),
                events,
                counters: Counters::default(),
                triggers: TriggerBinder::new(),
                tasks: TaskTracker::new(),
                runner,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_action(
        &self,
        name: impl Into<String>,
        definition: ActionDefinition,
    ) -> Result<(), EngineError> {
        self.inner.registry.register_action(name, definition)
    }

    pub fn register_condition(
        &self,
        name: impl Into<String>,
        definition: ConditionDefinition,
    ) -> Result<(), EngineError> {
        self.inner.registry.register_condition(name, definition)
    }

    pub fn register_trigger(
        &self,
        name: impl Into<String>,
        definition: TriggerDefinition,
    ) -> Result<(), EngineError> {
        self.inner.registry.register_trigger(name, definition)
    }

    /// Register or replace a workflow.
    ///
    /// Re-registering an id bumps `version` and re-binds (or unbinds) the
    /// trigger. Running instances keep the definition they started with.
    pub fn register_workflow(
        &self,
        id: &str,
        config: WorkflowConfig,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        validate_workflow(id, &config)?;
        let trigger = match &config.trigger {
            Some(binding) => Some(self.trigger_definition(&binding.trigger)?),
            None => None,
        };

        let inner = &self.inner;
        let version = inner
            .workflows
            .get(id)
            .map(|existing| existing.version + 1)
            .unwrap_or(1);
        let definition = Arc::new(WorkflowDefinition::from_config(
            id,
            config,
            inner.config.default_timeout_ms,
            version,
        ));
        inner.workflows.insert(id.to_string(), definition.clone());

        match (&definition.trigger, &trigger) {
            (Some(binding), Some(events)) => inner.triggers.bind(id, binding, events),
            _ => {
                inner.triggers.unbind(id);
            }
        }

        tracing::info!(
            workflow_id = id,
            name = %definition.name,
            version,
            steps = definition.steps.len(),
            "workflow registered"
        );
        inner.events.publish(EngineEvent::WorkflowRegistered {
            workflow_id: id.to_string(),
            name: definition.name.clone(),
            version,
        });
        Ok(definition)
    }

    /// Remove a workflow and its trigger listeners.
    pub fn unregister_workflow(&self, id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let (_, definition) = self
            .inner
            .workflows
            .remove(id)
            .ok_or_else(|| EngineError::not_found(ResourceKind::Workflow, id))?;
        self.inner.triggers.unbind(id);
        tracing::info!(workflow_id = id, "workflow unregistered");
        Ok(definition)
    }

    /// Bind a registered workflow to a registered trigger.
    pub fn setup_workflow_trigger(
        &self,
        workflow_id: &str,
        binding: &TriggerBinding,
    ) -> Result<(), EngineError> {
        if !self.inner.workflows.contains_key(workflow_id) {
            return Err(EngineError::not_found(ResourceKind::Workflow, workflow_id));
        }
        let definition = self.trigger_definition(&binding.trigger)?;
        self.inner.triggers.bind(workflow_id, binding, &definition);
        Ok(())
    }

    fn trigger_definition(&self, name: &str) -> Result<TriggerDefinition, EngineError> {
        self.inner
            .registry
            .trigger(name)
            .ok_or_else(|| EngineError::not_found(ResourceKind::Trigger, name))
    }

    pub fn get_workflow(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.workflows.get(id).map(|entry| entry.value().clone())
    }

    /// All registered workflows, sorted by id.
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut workflows: Vec<_> = self
            .inner
            .workflows
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run a workflow to completion.
    ///
    /// Admission is checked synchronously: when `max_concurrent_instances`
    /// instances are already running the call fails immediately with
    /// [`EngineError::ConcurrencyLimit`]. The instance's data starts as the
    /// workflow variables overlaid with the caller's data.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        ctx: ExecutionContext,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        let definition = self
            .get_workflow(workflow_id)
            .ok_or_else(|| EngineError::not_found(ResourceKind::Workflow, workflow_id))?;
        if !definition.enabled {
            return Err(EngineError::WorkflowDisabled(workflow_id.to_string()));
        }
        let mut data = definition.variables.clone();
        data.extend(ctx.snapshot().await);

        // Nothing below awaits until the supervisor owns the instance.
        let permit = inner.admission.clone().try_acquire_owned().map_err(|_| {
            EngineError::ConcurrencyLimit {
                max: inner.config.max_concurrent_instances,
            }
        })?;

        let instance_id = Uuid::now_v7();
        let trigger = ctx.trigger().map(|origin| origin.trigger.clone());
        let slot = Arc::new(InstanceSlot::new(
            WorkflowInstance::new(instance_id, workflow_id, trigger.clone()),
            Some(permit),
        ));
        inner.instances.insert(instance_id, slot.clone());
        inner.counters.total.fetch_add(1, Ordering::Relaxed);

        let timeout_ms = options
            .timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(definition.timeout_ms);
        let scope = RunScope {
            workflow_id: workflow_id.to_string(),
            instance_id,
            instance: slot.clone(),
            context: ctx.fork(data),
            retry_attempts: definition.retry_attempts,
            max_iterations: inner.config.default_max_iterations,
        };
        let engine = self.clone();
        let supervisor = inner.tasks.spawn(async move {
            engine.supervise(definition, scope, trigger, timeout_ms).await
        });

        match supervisor.await {
            Ok(result) => result,
            Err(e) => self.joined(Err(e), &slot).await,
        }
    }

    /// Drive one admitted instance until it settles.
    ///
    /// Runs as a tracked task, so the deadline and the stop token are
    /// honoured whether or not the caller of `execute_workflow` is still
    /// waiting for the outcome.
    async fn supervise(
        &self,
        definition: Arc<WorkflowDefinition>,
        scope: RunScope,
        trigger: Option<String>,
        timeout_ms: u64,
    ) -> Result<ExecutionResult, EngineError> {
        let inner = &self.inner;
        let slot = scope.instance.clone();
        let workflow_id = scope.workflow_id.clone();
        let instance_id = scope.instance_id;

        // Shutdown may have swept the instance table just before this
        // instance was inserted.
        if inner.shutting_down.load(Ordering::Acquire) {
            self.stop_slot(&slot, "engine shutdown").await;
            return Err(stopped_error(&slot.snapshot().await));
        }

        slot.arm_timer(Duration::from_millis(timeout_ms)).await;
        tracing::info!(workflow_id = %workflow_id, %instance_id, timeout_ms, "workflow started");
        inner.events.publish(EngineEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            instance_id,
            trigger,
        });

        let engine = self.clone();
        let mut run = inner.tasks.spawn(async move {
            let result = engine
                .inner
                .runner
                .run_sequence(&definition.steps, &scope, &Region::root())
                .await;
            engine.finish_run(&scope, result, timeout_ms).await
        });

        let race = tokio::select! {
            biased;
            joined = &mut run => Race::Finished(joined),
            _ = slot.deadline_token().cancelled() => Race::TimedOut,
            _ = slot.stop_token().cancelled() => Race::Halted,
        };

        match race {
            Race::Finished(joined) => self.joined(joined, &slot).await,
            Race::TimedOut => match self.expire(&slot, timeout_ms).await {
                Some(record) => Err(timeout_error(&record, timeout_ms)),
                None => self.settled_elsewhere(run, &slot).await,
            },
            Race::Halted => self.settled_elsewhere(run, &slot).await,
        }
    }

    /// Settle a running instance as timed out; `None` if it already settled.
    async fn expire(&self, slot: &InstanceSlot, timeout_ms: u64) -> Option<WorkflowInstance> {
        let message = format!("timed out after {timeout_ms}ms");
        let record = slot
            .settle(InstanceStatus::Failed, Some(message.clone()))
            .await?;
        self.record_settlement(&record, true);
        tracing::warn!(
            workflow_id = %record.workflow_id,
            instance_id = %record.id,
            timeout_ms,
            "workflow timed out"
        );
        self.inner.events.publish(EngineEvent::WorkflowFailed {
            workflow_id: record.workflow_id.clone(),
            instance_id: record.id,
            error: message,
            timed_out: true,
        });
        Some(record)
    }

    /// The slot settled on a path other than this call's; report that
    /// outcome, waiting for the run when it was the run that settled it.
    async fn settled_elsewhere(
        &self,
        run: tokio::task::JoinHandle<Result<ExecutionResult, EngineError>>,
        slot: &InstanceSlot,
    ) -> Result<ExecutionResult, EngineError> {
        let record = slot.snapshot().await;
        if record.status == InstanceStatus::Stopped {
            return Err(stopped_error(&record));
        }
        self.joined(run.await, slot).await
    }

    async fn joined(
        &self,
        joined: Result<Result<ExecutionResult, EngineError>, JoinError>,
        slot: &InstanceSlot,
    ) -> Result<ExecutionResult, EngineError> {
        match joined {
            Ok(result) => result,
            Err(e) => {
                let message = format!("step runner aborted: {e}");
                if let Some(record) = slot.settle(InstanceStatus::Failed, Some(message.clone())).await {
                    self.record_settlement(&record, false);
                    self.inner.events.publish(EngineEvent::WorkflowFailed {
                        workflow_id: record.workflow_id.clone(),
                        instance_id: record.id,
                        error: message.clone(),
                        timed_out: false,
                    });
                }
                let record = slot.snapshot().await;
                tracing::error!(instance_id = %record.id, error = %e, "step runner aborted");
                Err(EngineError::StepExecution {
                    workflow_id: record.workflow_id,
                    instance_id: record.id,
                    step_index: record.current_step_index,
                    path: record.current_step_index.to_string(),
                    step: String::new(),
                    message,
                })
            }
        }
    }

    /// Settle the instance from the run's own result.
    async fn finish_run(
        &self,
        scope: &RunScope,
        result: Result<Vec<Value>, StepError>,
        timeout_ms: u64,
    ) -> Result<ExecutionResult, EngineError> {
        let workflow_id = scope.workflow_id.clone();
        let instance_id = scope.instance_id;

        match result {
            Ok(_) => match scope.instance.settle(InstanceStatus::Completed, None).await {
                Some(record) => {
                    self.record_settlement(&record, false);
                    let duration_ms = record.duration_ms().unwrap_or(0);
                    tracing::info!(
                        workflow_id = %workflow_id,
                        %instance_id,
                        duration_ms,
                        steps = record.steps.len(),
                        "workflow completed"
                    );
                    self.inner.events.publish(EngineEvent::WorkflowCompleted {
                        workflow_id: workflow_id.clone(),
                        instance_id,
                        duration_ms,
                        steps: record.steps.len(),
                    });
                    Ok(ExecutionResult {
                        instance_id,
                        workflow_id,
                        status: record.status,
                        completed_at: record.completed_at.unwrap_or_else(Utc::now),
                        started_at: record.started_at,
                        steps: record.steps,
                        data: scope.context.snapshot().await,
                    })
                }
                None => Err(self.preempted(scope, timeout_ms).await),
            },
            Err(StepError::Failed(failure)) => {
                let message = format!("step '{}' failed: {}", failure.step, failure.message);
                match scope.instance.settle(InstanceStatus::Failed, Some(message.clone())).await {
                    Some(record) => {
                        self.record_settlement(&record, false);
                        tracing::warn!(
                            workflow_id = %workflow_id,
                            %instance_id,
                            step = %failure.step,
                            path = %failure.path,
                            error = %failure.message,
                            "workflow failed"
                        );
                        self.inner.events.publish(EngineEvent::WorkflowFailed {
                            workflow_id: workflow_id.clone(),
                            instance_id,
                            error: message,
                            timed_out: false,
                        });
                        Err(EngineError::StepExecution {
                            workflow_id,
                            instance_id,
                            step_index: failure.step_index,
                            path: failure.path,
                            step: failure.step,
                            message: failure.message,
                        })
                    }
                    None => Err(self.preempted(scope, timeout_ms).await),
                }
            }
            Err(StepError::Stopped) => Err(self.preempted(scope, timeout_ms).await),
        }
    }

    /// Error for a run that halted without settling its own instance.
    ///
    /// A run that saw the deadline before the supervisor did settles the
    /// timeout itself.
    async fn preempted(&self, scope: &RunScope, timeout_ms: u64) -> EngineError {
        let record = scope.instance.snapshot().await;
        match record.status {
            InstanceStatus::Stopped => stopped_error(&record),
            InstanceStatus::Running => {
                self.expire(&scope.instance, timeout_ms).await;
                timeout_error(&record, timeout_ms)
            }
            _ => timeout_error(&record, timeout_ms),
        }
    }

    fn record_settlement(&self, record: &WorkflowInstance, timed_out: bool) {
        let counters = &self.inner.counters;
        match record.status {
            InstanceStatus::Completed => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            InstanceStatus::Failed => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                if timed_out {
                    counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
            }
            InstanceStatus::Stopped => {
                counters.stopped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            InstanceStatus::Running => return,
        }
        if let Some(duration) = record.duration_ms() {
            counters.duration_total_ms.fetch_add(duration, Ordering::Relaxed);
            counters.duration_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Request a cooperative stop of a running instance.
    ///
    /// The instance settles as stopped immediately and frees its concurrency
    /// slot; its step sequence halts at the next step boundary.
    pub async fn stop_workflow(
        &self,
        instance_id: Uuid,
        reason: Option<&str>,
    ) -> Result<WorkflowInstance, EngineError> {
        let slot = self
            .slot(instance_id)
            .ok_or_else(|| EngineError::not_found(ResourceKind::Instance, instance_id.to_string()))?;
        let reason = reason.unwrap_or("stopped by request");
        match self.stop_slot(&slot, reason).await {
            Some(record) => Ok(record),
            None => Err(EngineError::InvalidState {
                instance_id,
                status: slot.status().await,
            }),
        }
    }

    async fn stop_slot(&self, slot: &InstanceSlot, reason: &str) -> Option<WorkflowInstance> {
        let record = slot
            .settle(InstanceStatus::Stopped, Some(reason.to_string()))
            .await?;
        self.record_settlement(&record, false);
        tracing::info!(
            workflow_id = %record.workflow_id,
            instance_id = %record.id,
            reason,
            "workflow stopped"
        );
        self.inner.events.publish(EngineEvent::WorkflowStopped {
            workflow_id: record.workflow_id.clone(),
            instance_id: record.id,
            reason: reason.to_string(),
        });
        Some(record)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    fn slot(&self, instance_id: Uuid) -> Option<Arc<InstanceSlot>> {
        self.inner
            .instances
            .get(&instance_id)
            .map(|entry| entry.value().clone())
    }

    fn slots(&self) -> Vec<Arc<InstanceSlot>> {
        self.inner
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Option<WorkflowInstance> {
        let slot = self.slot(instance_id)?;
        Some(slot.snapshot().await)
    }

    /// Instances matching `filter`, oldest first.
    pub async fn list_instances(&self, filter: &InstanceFilter) -> Vec<WorkflowInstance> {
        let mut instances = Vec::new();
        for slot in self.slots() {
            let record = slot.snapshot().await;
            if filter.matches(&record) {
                instances.push(record);
            }
        }
        instances.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            let excess = instances.len().saturating_sub(limit);
            instances.drain(..excess);
        }
        instances
    }

    /// Number of instances currently holding a concurrency slot.
    pub fn running_count(&self) -> usize {
        self.inner.config.max_concurrent_instances - self.inner.admission.available_permits()
    }

    /// Number of instances whose timeout timer is still armed.
    pub async fn pending_timers(&self) -> usize {
        let mut armed = 0;
        for slot in self.slots() {
            if slot.timer_armed().await {
                armed += 1;
            }
        }
        armed
    }

    pub fn get_stats(&self) -> EngineStats {
        let counters = &self.inner.counters;
        let samples = counters.duration_samples.load(Ordering::Relaxed);
        let average_duration_ms = match samples {
            0 => 0,
            n => counters.duration_total_ms.load(Ordering::Relaxed) / n,
        };
        EngineStats {
            total_executions: counters.total.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            stopped: counters.stopped.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            running: self.running_count(),
            average_duration_ms,
            registered_workflows: self.inner.workflows.len(),
            registered_actions: self.inner.registry.action_count(),
            registered_conditions: self.inner.registry.condition_count(),
            registered_triggers: self.inner.registry.trigger_count(),
        }
    }

    /// Remove terminal instances that settled at least `max_age` ago.
    ///
    /// Running instances are never removed. Returns how many were removed.
    pub async fn cleanup_instances(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut expired = Vec::new();
        for slot in self.slots() {
            let record = slot.snapshot().await;
            let old_enough = record
                .completed_at
                .is_some_and(|completed| now - completed >= max_age);
            if record.status.is_terminal() && old_enough {
                expired.push(record.id);
            }
        }
        for id in &expired {
            self.inner.instances.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "cleaned up instances");
        }
        expired.len()
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Deliver an external event to every workflow bound to it.
    ///
    /// Returns the number of dispatches scheduled. Dispatches run in the
    /// background; failures are logged, never returned.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            tracing::debug!(event, "engine shut down, event dropped");
            return 0;
        }
        let listeners = self.inner.triggers.listeners_for(event);
        let scheduled = listeners.len();
        for listener in listeners {
            tracing::debug!(event, workflow_id = %listener.workflow_id, "dispatching trigger");
            self.inner.tasks.spawn(trigger::deliver(
                self.clone(),
                listener,
                event.to_string(),
                payload.clone(),
            ));
        }
        scheduled
    }

    /// Wait until every background dispatch and detached step run is done.
    pub async fn wait_for_dispatches(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        if !self.inner.shutting_down.load(Ordering::Acquire) {
            tasks.reopen();
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop every running instance and refuse further work.
    ///
    /// Returns how many instances were stopped. Idempotent.
    pub async fn shutdown(&self) -> usize {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut stopped = 0;
        for slot in self.slots() {
            if self.stop_slot(&slot, "engine shutdown").await.is_some() {
                stopped += 1;
            }
        }
        self.inner.tasks.close();
        tracing::info!(stopped_instances = stopped, "engine shut down");
        self.inner.events.publish(EngineEvent::Shutdown {
            stopped_instances: stopped,
        });
        stopped
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }
}

fn stopped_error(record: &WorkflowInstance) -> EngineError {
    EngineError::Stopped {
        workflow_id: record.workflow_id.clone(),
        instance_id: record.id,
        reason: record.error.clone().unwrap_or_default(),
    }
}

fn timeout_error(record: &WorkflowInstance, timeout_ms: u64) -> EngineError {
    EngineError::Timeout {
        workflow_id: record.workflow_id.clone(),
        instance_id: record.id,
        timeout_ms,
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflows", &self.inner.workflows.len())
            .field("instances", &self.inner.instances.len())
            .field("running", &self.running_count())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::TriggerOrigin;
    use crate::workflow::registry::ActionError;
    use serde_json::json;
    use std::time::Instant;
    use stepwise_types::instance::StepStatus;
    use stepwise_types::workflow::{ConditionCall, StepNode, SwitchCase};

    fn engine(max: usize) -> Engine {
        let engine = Engine::new(EngineConfig::default().with_max_concurrent_instances(max));
        engine
            .register_action(
                "echo",
                ActionDefinition::from_fn(|_ctx, params| async move { Ok::<_, ActionError>(params) }),
            )
            .unwrap();
        engine
            .register_action(
                "boom",
                ActionDefinition::from_fn(|_ctx, _params| async move {
                    Err::<Value, _>(ActionError::failed("boom"))
                }),
            )
            .unwrap();
        engine
            .register_action(
                "sleep",
                ActionDefinition::from_fn(|_ctx, params: Value| async move {
                    let ms = params["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, ActionError>(json!(ms))
                }),
            )
            .unwrap();
        engine
            .register_action(
                "origin",
                ActionDefinition::from_fn(|ctx: ExecutionContext, _params| async move {
                    let event = ctx.trigger().map(|t| t.event.clone());
                    Ok::<_, ActionError>(json!(event))
                }),
            )
            .unwrap();
        engine
            .register_condition(
                "always",
                ConditionDefinition::from_fn(|_ctx, _params| async move { Ok::<_, ActionError>(true) }),
            )
            .unwrap();
        engine
            .register_condition(
                "is_paid",
                ConditionDefinition::from_fn(|_ctx, params: Value| async move {
                    Ok::<_, ActionError>(params["status"] == json!("paid"))
                }),
            )
            .unwrap();
        engine
    }

    fn slow(ms: u64) -> WorkflowConfig {
        WorkflowConfig::new("slow", vec![StepNode::action("sleep", json!({ "ms": ms }))])
    }

    async fn run(engine: &Engine, id: &str) -> Result<ExecutionResult, EngineError> {
        engine
            .execute_workflow(id, ExecutionContext::new(), ExecuteOptions::default())
            .await
    }

    #[tokio::test]
    async fn non_critical_failure_is_recorded_and_stepped_over() {
        let engine = engine(4);
        let steps = (0..5)
            .map(|i| {
                let name = if i == 2 { "boom" } else { "echo" };
                StepNode::action(name, json!({ "i": i })).non_critical()
            })
            .collect();
        engine
            .register_workflow("wf", WorkflowConfig::new("five", steps))
            .unwrap();

        let result = run(&engine, "wf").await.unwrap();
        assert_eq!(result.status, InstanceStatus::Completed);
        assert_eq!(result.steps.len(), 5);
        for (i, step) in result.steps.iter().enumerate() {
            let expected = if i == 2 { StepStatus::Failed } else { StepStatus::Completed };
            assert_eq!(step.status, expected, "step {i}");
        }
        assert_eq!(result.steps[2].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn critical_failure_rejects_but_keeps_partial_history() {
        let engine = engine(4);
        engine
            .register_workflow(
                "wf",
                WorkflowConfig::new(
                    "abort",
                    vec![
                        StepNode::action("echo", json!(1)),
                        StepNode::action("boom", json!({})),
                        StepNode::action("echo", json!(3)),
                    ],
                ),
            )
            .unwrap();

        let err = run(&engine, "wf").await.unwrap_err();
        let EngineError::StepExecution {
            workflow_id,
            step_index,
            step,
            ..
        } = &err
        else {
            panic!("expected step execution error, got {err:?}");
        };
        assert_eq!(workflow_id, "wf");
        assert_eq!(*step_index, 1);
        assert_eq!(step, "boom");

        let instance = engine.get_instance(err.instance_id().unwrap()).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.steps.len(), 2);
        assert_eq!(instance.steps[0].status, StepStatus::Completed);
        assert_eq!(instance.steps[1].status, StepStatus::Failed);
        assert!(!instance.timer_active);
        assert_eq!(engine.get_stats().failed, 1);
    }

    #[tokio::test]
    async fn concurrency_bound_rejects_exactly_the_overflow() {
        let engine = engine(2);
        engine.register_workflow("slow", slow(100)).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { run(&engine, "slow").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.running_count(), 2);

        let mut limited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => {}
                Err(EngineError::ConcurrencyLimit { max }) => {
                    assert_eq!(max, 2);
                    limited += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(limited, 1);
        assert_eq!(engine.running_count(), 0);
        assert!(run(&engine, "slow").await.is_ok());
    }

    #[tokio::test]
    async fn timeout_fails_fast_and_clears_timer() {
        let engine = engine(4);
        engine
            .register_workflow("wf", slow(500).with_timeout_ms(50))
            .unwrap();

        let started = Instant::now();
        let err = run(&engine, "wf").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        let EngineError::Timeout {
            timeout_ms,
            instance_id,
            ..
        } = err
        else {
            panic!("expected timeout");
        };
        assert_eq!(timeout_ms, 50);

        let instance = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(!instance.timer_active);
        assert_eq!(instance.steps[0].status, StepStatus::Failed);
        assert_eq!(engine.pending_timers().await, 0);
        assert_eq!(engine.running_count(), 0);

        let stats = engine.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);

        // The detached run halts after its in-flight action returns.
        engine.wait_for_dispatches().await;
        let instance = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.steps.len(), 1);
    }

    #[tokio::test]
    async fn timeout_settles_after_the_caller_is_aborted() {
        let engine = engine(1);
        engine
            .register_workflow("wf", slow(600).with_timeout_ms(50))
            .unwrap();
        engine
            .register_workflow("quick", WorkflowConfig::new("quick", vec![StepNode::action("echo", json!(1))]))
            .unwrap();

        let caller = {
            let engine = engine.clone();
            tokio::spawn(async move { run(&engine, "wf").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let instances = engine.list_instances(&InstanceFilter::default()).await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceStatus::Failed);
        assert_eq!(instances[0].error.as_deref(), Some("timed out after 50ms"));
        assert!(!instances[0].timer_active);
        assert_eq!(engine.running_count(), 0);
        assert_eq!(engine.pending_timers().await, 0);

        let stats = engine.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        assert!(run(&engine, "quick").await.is_ok());
    }

    #[tokio::test]
    async fn outer_timeout_around_the_call_keeps_the_deadline() {
        let engine = engine(1);
        engine
            .register_workflow("wf", slow(300).with_timeout_ms(40))
            .unwrap();
        let mut events = engine.subscribe();

        let outer = tokio::time::timeout(Duration::from_millis(5), run(&engine, "wf")).await;
        assert!(outer.is_err());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(engine.running_count(), 0);
        let mut timed_out = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::WorkflowFailed { timed_out: true, error, .. } = event {
                assert_eq!(error, "timed out after 40ms");
                timed_out = true;
            }
        }
        assert!(timed_out);
    }

    #[tokio::test]
    async fn instance_admitted_during_shutdown_is_stopped() {
        let engine = engine(1);
        let definition = engine.register_workflow("wf", slow(50)).unwrap();
        let permit = engine.inner.admission.clone().try_acquire_owned().unwrap();
        let instance_id = Uuid::now_v7();
        let slot = Arc::new(InstanceSlot::new(
            WorkflowInstance::new(instance_id, "wf", None),
            Some(permit),
        ));

        // The sweep runs before the instance lands in the table.
        assert_eq!(engine.shutdown().await, 0);
        engine.inner.instances.insert(instance_id, slot.clone());

        let scope = RunScope {
            workflow_id: "wf".to_string(),
            instance_id,
            instance: slot,
            context: ExecutionContext::new(),
            retry_attempts: 0,
            max_iterations: 100,
        };
        let err = engine
            .supervise(definition, scope, None, 1_000)
            .await
            .unwrap_err();
        assert!(matches!(&err, EngineError::Stopped { reason, .. } if reason == "engine shutdown"));

        let instance = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert!(instance.steps.is_empty());
        assert_eq!(engine.running_count(), 0);
        assert_eq!(engine.pending_timers().await, 0);
        assert_eq!(engine.get_stats().stopped, 1);
    }

    #[tokio::test]
    async fn critical_parallel_failure_aborts_after_every_branch_settles() {
        let engine = engine(4);
        engine
            .register_workflow(
                "wf",
                WorkflowConfig::new(
                    "fan-out",
                    vec![
                        StepNode::action("echo", json!("before")),
                        StepNode::parallel(vec![
                            StepNode::action("sleep", json!({ "ms": 40 })),
                            StepNode::action("boom", json!({})),
                            StepNode::action("sleep", json!({ "ms": 5 })),
                        ]),
                        StepNode::action("echo", json!("after")),
                    ],
                ),
            )
            .unwrap();

        let err = run(&engine, "wf").await.unwrap_err();
        let EngineError::StepExecution {
            step_index,
            path,
            step,
            ..
        } = &err
        else {
            panic!("expected step execution error, got {err:?}");
        };
        assert_eq!(*step_index, 1);
        assert_eq!(path, "1.1");
        assert_eq!(step, "boom");

        let instance = engine.get_instance(err.instance_id().unwrap()).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        let status = |path: &str| {
            instance
                .steps
                .iter()
                .find(|s| s.path == path)
                .map(|s| s.status)
        };
        assert_eq!(status("0"), Some(StepStatus::Completed));
        assert_eq!(status("1"), Some(StepStatus::Failed));
        assert_eq!(status("1.0"), Some(StepStatus::Completed));
        assert_eq!(status("1.1"), Some(StepStatus::Failed));
        assert_eq!(status("1.2"), Some(StepStatus::Completed));
        assert_eq!(status("2"), None);
        assert_eq!(instance.steps.len(), 5);
    }

    #[tokio::test]
    async fn execute_option_overrides_timeout() {
        let engine = engine(4);
        engine.register_workflow("wf", slow(200)).unwrap();
        let err = engine
            .execute_workflow(
                "wf",
                ExecutionContext::new(),
                ExecuteOptions::default().with_timeout_ms(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn completed_instance_leaves_no_timer() {
        let engine = engine(4);
        engine
            .register_workflow("wf", WorkflowConfig::new("quick", vec![StepNode::action("echo", json!(1))]))
            .unwrap();
        let result = run(&engine, "wf").await.unwrap();
        assert_eq!(result.status, InstanceStatus::Completed);
        assert_eq!(engine.pending_timers().await, 0);
        let instance = engine.get_instance(result.instance_id).await.unwrap();
        assert!(!instance.timer_active);
        assert!(instance.completed_at.is_some());
    }

    #[tokio::test]
    async fn always_true_loop_stops_at_one_hundred() {
        let engine = engine(4);
        engine
            .register_workflow(
                "wf",
                WorkflowConfig::new(
                    "spin",
                    vec![
                        StepNode::loop_while(
                            ConditionCall::new("always", json!({})),
                            vec![StepNode::action("echo", json!({}))],
                        )
                        .with_output("spin"),
                    ],
                ),
            )
            .unwrap();
        let result = run(&engine, "wf").await.unwrap();
        assert_eq!(result.data["spin"]["iterations"], json!(100));
        assert_eq!(result.data["spin"]["capped"], json!(true));
        assert_eq!(result.steps.len(), 101);
    }

    #[tokio::test]
    async fn switch_records_unmatched_or_runs_default() {
        let engine = engine(4);
        let cases = vec![
            SwitchCase::new(json!("a"), vec![StepNode::action("echo", json!("A"))]),
            SwitchCase::new(json!("b"), vec![StepNode::action("echo", json!("B"))]),
        ];
        engine
            .register_workflow(
                "plain",
                WorkflowConfig::new(
                    "plain",
                    vec![StepNode::switch(json!("{{ input }}"), cases.clone(), None).with_output("out")],
                )
                .with_variable("input", json!("c")),
            )
            .unwrap();
        engine
            .register_workflow(
                "fallback",
                WorkflowConfig::new(
                    "fallback",
                    vec![
                        StepNode::switch(
                            json!("{{ input }}"),
                            cases,
                            Some(vec![StepNode::action("echo", json!("D"))]),
                        )
                        .with_output("out"),
                    ],
                )
                .with_variable("input", json!("c")),
            )
            .unwrap();

        let plain = run(&engine, "plain").await.unwrap();
        assert_eq!(plain.data["out"], json!({ "matched": false }));

        let fallback = run(&engine, "fallback").await.unwrap();
        assert_eq!(fallback.data["out"]["default"], json!(true));
        assert_eq!(fallback.data["out"]["results"], json!(["D"]));
        assert_eq!(fallback.steps[1].path, "0.default.0");
    }

    #[tokio::test]
    async fn caller_data_overrides_workflow_variables() {
        let engine = engine(4);
        engine
            .register_workflow(
                "wf",
                WorkflowConfig::new(
                    "greet",
                    vec![
                        StepNode::action(
                            "echo",
                            json!({ "text": "{{ greeting }} {{ user.name }}", "missing": "{{ user.missing }}" }),
                        )
                        .with_output("out"),
                    ],
                )
                .with_variable("greeting", json!("hi"))
                .with_variable("user", json!({ "name": "default" })),
            )
            .unwrap();

        let ctx = ExecutionContext::from_value(json!({ "user": { "name": "Ana" } }));
        let result = engine
            .execute_workflow("wf", ctx, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.data["out"], json!({ "text": "hi Ana" }));
        assert_eq!(result.data["greeting"], json!("hi"));
    }

    #[tokio::test]
    async fn stop_is_cooperative_and_frees_the_slot() {
        let engine = engine(1);
        engine
            .register_workflow(
                "wf",
                WorkflowConfig::new(
                    "stoppable",
                    vec![
                        StepNode::action("sleep", json!({ "ms": 100 })),
                        StepNode::action("echo", json!("never")),
                    ],
                ),
            )
            .unwrap();

        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { run(&engine, "wf").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let running = engine
            .list_instances(&InstanceFilter {
                status: Some(InstanceStatus::Running),
                ..InstanceFilter::default()
            })
            .await;
        assert_eq!(running.len(), 1);
        let instance_id = running[0].id;

        let stopped = engine.stop_workflow(instance_id, Some("operator")).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert_eq!(engine.running_count(), 0);
        assert_eq!(engine.pending_timers().await, 0);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(&err, EngineError::Stopped { reason, .. } if reason == "operator"));

        let again = engine.stop_workflow(instance_id, None).await.unwrap_err();
        assert!(matches!(
            again,
            EngineError::InvalidState {
                status: InstanceStatus::Stopped,
                ..
            }
        ));
        let missing = engine.stop_workflow(Uuid::now_v7(), None).await.unwrap_err();
        assert!(matches!(
            missing,
            EngineError::NotFound {
                kind: ResourceKind::Instance,
                ..
            }
        ));

        // The in-flight sleep finishes; the next step never starts.
        engine.wait_for_dispatches().await;
        let instance = engine.get_instance(instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Stopped);
        assert_eq!(instance.steps.len(), 1);
        assert_eq!(instance.steps[0].status, StepStatus::Completed);
        assert_eq!(engine.get_stats().stopped, 1);
    }

    #[tokio::test]
    async fn stop_on_completed_instance_fails() {
        let engine = engine(4);
        engine
            .register_workflow("wf", WorkflowConfig::new("quick", vec![StepNode::action("echo", json!(1))]))
            .unwrap();
        let result = run(&engine, "wf").await.unwrap();
        let err = engine.stop_workflow(result.instance_id, None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                status: InstanceStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_every_running_instance() {
        let engine = engine(5);
        engine.register_workflow("slow", slow(200)).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { run(&engine, "slow").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut events = engine.subscribe();
        assert_eq!(engine.shutdown().await, 3);
        assert_eq!(engine.shutdown().await, 0);
        assert_eq!(engine.pending_timers().await, 0);
        assert_eq!(engine.running_count(), 0);

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(EngineError::Stopped { .. })));
        }
        let all = engine.list_instances(&InstanceFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|i| i.status == InstanceStatus::Stopped));

        let mut saw_shutdown = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Shutdown { stopped_instances } = event {
                assert_eq!(stopped_instances, 3);
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown);

        assert!(matches!(run(&engine, "slow").await, Err(EngineError::ShuttingDown)));
        assert_eq!(engine.emit("anything", json!({})), 0);
    }

    #[tokio::test]
    async fn lookup_and_state_errors() {
        let engine = engine(4);
        assert!(matches!(
            run(&engine, "ghost").await,
            Err(EngineError::NotFound {
                kind: ResourceKind::Workflow,
                ..
            })
        ));

        engine
            .register_workflow("off", WorkflowConfig::new("off", vec![StepNode::action("echo", json!(1))]).disabled())
            .unwrap();
        assert!(matches!(run(&engine, "off").await, Err(EngineError::WorkflowDisabled(_))));

        let unbound = WorkflowConfig::new("t", vec![StepNode::action("echo", json!(1))])
            .with_trigger(TriggerBinding::new("nope"));
        assert!(matches!(
            engine.register_workflow("t", unbound),
            Err(EngineError::NotFound {
                kind: ResourceKind::Trigger,
                ..
            })
        ));
        assert!(engine.get_workflow("t").is_none());
    }

    #[tokio::test]
    async fn reregistration_bumps_version_and_rebinds() {
        let engine = engine(4);
        engine
            .register_trigger("orders", TriggerDefinition::new(["order.paid"]))
            .unwrap();
        engine
            .register_trigger("signups", TriggerDefinition::new(["user.created"]))
            .unwrap();

        let first = engine
            .register_workflow(
                "wf",
                WorkflowConfig::new("v1", vec![StepNode::action("echo", json!(1))])
                    .with_trigger(TriggerBinding::new("orders")),
            )
            .unwrap();
        assert_eq!(first.version, 1);

        let second = engine
            .register_workflow(
                "wf",
                WorkflowConfig::new("v2", vec![StepNode::action("echo", json!(2))])
                    .with_trigger(TriggerBinding::new("signups")),
            )
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(engine.get_workflow("wf").unwrap().name, "v2");
        assert_eq!(engine.list_workflows().len(), 1);

        assert_eq!(engine.emit("order.paid", json!({})), 0);
        assert_eq!(engine.emit("user.created", json!({})), 1);
        engine.wait_for_dispatches().await;

        engine.unregister_workflow("wf").unwrap();
        assert_eq!(engine.emit("user.created", json!({})), 0);
        assert!(engine.unregister_workflow("wf").is_err());
    }

    #[tokio::test]
    async fn trigger_guard_filters_deliveries() {
        let engine = engine(4);
        engine
            .register_trigger("orders", TriggerDefinition::new(["order.paid", "order.updated"]))
            .unwrap();
        engine
            .register_workflow(
                "ship",
                WorkflowConfig::new("ship", vec![StepNode::action("origin", json!({})).with_output("event")])
                    .with_trigger(
                        TriggerBinding::new("orders")
                            .when(ConditionCall::new("is_paid", json!({ "status": "{{ status }}" }))),
                    ),
            )
            .unwrap();

        assert_eq!(engine.emit("order.paid", json!({ "status": "paid" })), 1);
        assert_eq!(engine.emit("order.updated", json!({ "status": "pending" })), 1);
        assert_eq!(engine.emit("unrelated", json!({ "status": "paid" })), 0);
        engine.wait_for_dispatches().await;

        let instances = engine
            .list_instances(&InstanceFilter {
                workflow_id: Some("ship".to_string()),
                ..InstanceFilter::default()
            })
            .await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].trigger.as_deref(), Some("orders"));
        assert_eq!(instances[0].status, InstanceStatus::Completed);
        assert_eq!(instances[0].steps[0].output, Some(json!("order.paid")));
    }

    #[tokio::test]
    async fn trigger_dispatch_errors_never_reach_the_publisher() {
        let engine = engine(4);
        engine
            .register_trigger("clock", TriggerDefinition::new(["tick"]))
            .unwrap();
        engine
            .register_workflow(
                "broken",
                WorkflowConfig::new("broken", vec![StepNode::action("boom", json!({}))])
                    .with_trigger(TriggerBinding::new("clock")),
            )
            .unwrap();
        assert_eq!(engine.emit("tick", json!("ping")), 1);
        engine.wait_for_dispatches().await;
        assert_eq!(engine.get_stats().failed, 1);
    }

    #[tokio::test]
    async fn setup_workflow_trigger_binds_existing_workflow() {
        let engine = engine(4);
        engine
            .register_trigger("clock", TriggerDefinition::new(["tick"]))
            .unwrap();
        engine
            .register_workflow("wf", WorkflowConfig::new("wf", vec![StepNode::action("echo", json!(1))]))
            .unwrap();
        assert!(engine
            .setup_workflow_trigger("missing", &TriggerBinding::new("clock"))
            .is_err());
        engine
            .setup_workflow_trigger("wf", &TriggerBinding::new("clock"))
            .unwrap();
        assert_eq!(engine.emit("tick", json!({})), 1);
        engine.wait_for_dispatches().await;
        assert_eq!(engine.get_stats().completed, 1);
    }

    #[tokio::test]
    async fn provenance_survives_seeding() {
        let engine = engine(4);
        engine
            .register_workflow("wf", WorkflowConfig::new("wf", vec![StepNode::action("origin", json!({}))]))
            .unwrap();
        let ctx = ExecutionContext::new().with_trigger(TriggerOrigin {
            trigger: "manual".to_string(),
            event: "button".to_string(),
        });
        let result = engine
            .execute_workflow("wf", ctx, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.steps[0].output, Some(json!("button")));
        let instance = engine.get_instance(result.instance_id).await.unwrap();
        assert_eq!(instance.trigger.as_deref(), Some("manual"));
    }

    #[tokio::test]
    async fn list_limit_and_cleanup() {
        let engine = engine(4);
        engine
            .register_workflow("wf", WorkflowConfig::new("wf", vec![StepNode::action("echo", json!(1))]))
            .unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(run(&engine, "wf").await.unwrap().instance_id);
        }

        let recent = engine
            .list_instances(&InstanceFilter {
                limit: Some(2),
                ..InstanceFilter::default()
            })
            .await;
        let recent_ids: Vec<Uuid> = recent.iter().map(|i| i.id).collect();
        assert_eq!(recent_ids, ids[1..].to_vec());

        assert_eq!(engine.cleanup_instances(Duration::from_secs(3600)).await, 0);
        assert_eq!(engine.cleanup_instances(Duration::ZERO).await, 3);
        assert!(engine.list_instances(&InstanceFilter::default()).await.is_empty());
        assert!(engine.get_instance(ids[0]).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_never_removes_running_instances() {
        let engine = engine(4);
        engine.register_workflow("slow", slow(80)).unwrap();
        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { run(&engine, "slow").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.cleanup_instances(Duration::ZERO).await, 0);
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(engine.cleanup_instances(Duration::ZERO).await, 1);
    }

    #[tokio::test]
    async fn lifecycle_events_follow_execution() {
        let engine = engine(4);
        let mut events = engine.subscribe();
        engine
            .register_workflow("wf", WorkflowConfig::new("wf", vec![StepNode::action("echo", json!(1))]))
            .unwrap();
        run(&engine, "wf").await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "workflow-registered",
                "workflow-started",
                "step-started",
                "step-completed",
                "workflow-completed",
            ]
        );
    }

    #[tokio::test]
    async fn stats_aggregate_outcomes() {
        let engine = engine(4);
        engine
            .register_workflow("ok", WorkflowConfig::new("ok", vec![StepNode::action("echo", json!(1))]))
            .unwrap();
        engine
            .register_workflow("bad", WorkflowConfig::new("bad", vec![StepNode::action("boom", json!({}))]))
            .unwrap();
        run(&engine, "ok").await.unwrap();
        run(&engine, "ok").await.unwrap();
        run(&engine, "bad").await.unwrap_err();

        let stats = engine.get_stats();
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.registered_workflows, 2);
        assert_eq!(stats.registered_actions, 4);
        assert_eq!(stats.registered_conditions, 2);
    }
}
