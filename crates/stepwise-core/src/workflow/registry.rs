//! Registry of named actions, conditions, and trigger definitions.
//!
//! Actions and conditions are traits with `impl Future` methods. Each has an
//! object-safe `*Dyn` twin with boxed futures and a blanket impl, so the
//! registry can store `Arc<dyn ActionDyn>` while implementors write plain
//! `async fn`s. Closures are accepted through `ActionDefinition::from_fn` /
//! `ConditionDefinition::from_fn`.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::workflow::ConditionCall;

use super::context::ExecutionContext;
use super::error::{EngineError, ResourceKind};

// ---------------------------------------------------------------------------
// ActionError
// ---------------------------------------------------------------------------

/// Error raised by an action or condition implementation.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        ActionError::InvalidParams(message.into())
    }
}

/// Failure to invoke a registered condition or action by name.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("{kind} '{name}' is not registered")]
    NotRegistered { kind: ResourceKind, name: String },

    #[error(transparent)]
    Action(#[from] ActionError),
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A side-effecting operation invoked by action steps.
pub trait Action: Send + Sync {
    fn execute(
        &self,
        ctx: &ExecutionContext,
        params: Value,
    ) -> impl Future<Output = Result<Value, ActionError>> + Send;
}

/// Object-safe version of [`Action`] with boxed futures.
pub trait ActionDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, ActionError>>;
}

impl<T: Action> ActionDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, ActionError>> {
        Box::pin(self.execute(ctx, params))
    }
}

/// Adapter turning a closure into an [`Action`].
pub struct FnAction<F>(F);

impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ExecutionContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send,
{
    fn execute(
        &self,
        ctx: &ExecutionContext,
        params: Value,
    ) -> impl Future<Output = Result<Value, ActionError>> + Send {
        (self.0)(ctx.clone(), params)
    }
}

/// A registered action: declared input names plus the implementation.
#[derive(Clone)]
pub struct ActionDefinition {
    pub inputs: Vec<String>,
    handler: Arc<dyn ActionDyn>,
}

impl ActionDefinition {
    pub fn new(action: impl Action + 'static) -> Self {
        Self {
            inputs: Vec::new(),
            handler: Arc::new(action),
        }
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        Self::new(FnAction(f))
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub async fn execute(&self, ctx: &ExecutionContext, params: Value) -> Result<Value, ActionError> {
        self.handler.execute_boxed(ctx, params).await
    }
}

impl std::fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A predicate evaluated against the execution context.
pub trait Condition: Send + Sync {
    fn evaluate(
        &self,
        ctx: &ExecutionContext,
        params: Value,
    ) -> impl Future<Output = Result<bool, ActionError>> + Send;
}

/// Object-safe version of [`Condition`] with boxed futures.
pub trait ConditionDyn: Send + Sync {
    fn evaluate_boxed<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        params: Value,
    ) -> BoxFuture<'a, Result<bool, ActionError>>;
}

impl<T: Condition> ConditionDyn for T {
    fn evaluate_boxed<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        params: Value,
    ) -> BoxFuture<'a, Result<bool, ActionError>> {
        Box::pin(self.evaluate(ctx, params))
    }
}

/// Adapter turning a closure into a [`Condition`].
pub struct FnCondition<F>(F);

impl<F, Fut> Condition for FnCondition<F>
where
    F: Fn(ExecutionContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, ActionError>> + Send,
{
    fn evaluate(
        &self,
        ctx: &ExecutionContext,
        params: Value,
    ) -> impl Future<Output = Result<bool, ActionError>> + Send {
        (self.0)(ctx.clone(), params)
    }
}

/// A registered condition.
#[derive(Clone)]
pub struct ConditionDefinition {
    pub inputs: Vec<String>,
    handler: Arc<dyn ConditionDyn>,
}

impl ConditionDefinition {
    pub fn new(condition: impl Condition + 'static) -> Self {
        Self {
            inputs: Vec::new(),
            handler: Arc::new(condition),
        }
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, ActionError>> + Send + 'static,
    {
        Self::new(FnCondition(f))
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub async fn evaluate(&self, ctx: &ExecutionContext, params: Value) -> Result<bool, ActionError> {
        self.handler.evaluate_boxed(ctx, params).await
    }
}

impl std::fmt::Debug for ConditionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionDefinition")
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Trigger definition
// ---------------------------------------------------------------------------

/// A named set of external event names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDefinition {
    pub events: Vec<String>,
}

impl TriggerDefinition {
    pub fn new<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: events.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lookup table of actions, conditions, and triggers.
///
/// Written during setup, read on every step. Names are unique per table.
#[derive(Debug, Default)]
pub struct Registry {
    actions: DashMap<String, ActionDefinition>,
    conditions: DashMap<String, ConditionDefinition>,
    triggers: DashMap<String, TriggerDefinition>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action(
        &self,
        name: impl Into<String>,
        definition: ActionDefinition,
    ) -> Result<(), EngineError> {
        let name = name.into();
        validate_name("action", &name)?;
        validate_inputs(&name, &definition.inputs)?;
        insert_unique(&self.actions, "action", name, definition)
    }

    pub fn register_condition(
        &self,
        name: impl Into<String>,
        definition: ConditionDefinition,
    ) -> Result<(), EngineError> {
        let name = name.into();
        validate_name("condition", &name)?;
        validate_inputs(&name, &definition.inputs)?;
        insert_unique(&self.conditions, "condition", name, definition)
    }

    pub fn register_trigger(
        &self,
        name: impl Into<String>,
        definition: TriggerDefinition,
    ) -> Result<(), EngineError> {
        let name = name.into();
        validate_name("trigger", &name)?;
        if definition.events.is_empty() {
            return Err(EngineError::definition(format!(
                "trigger '{name}' must declare at least one event"
            )));
        }
        if definition.events.iter().any(|e| e.trim().is_empty()) {
            return Err(EngineError::definition(format!(
                "trigger '{name}' declares an empty event name"
            )));
        }
        insert_unique(&self.triggers, "trigger", name, definition)
    }

    pub fn action(&self, name: &str) -> Option<ActionDefinition> {
        self.actions.get(name).map(|entry| entry.value().clone())
    }

    pub fn condition(&self, name: &str) -> Option<ConditionDefinition> {
        self.conditions.get(name).map(|entry| entry.value().clone())
    }

    pub fn trigger(&self, name: &str) -> Option<TriggerDefinition> {
        self.triggers.get(name).map(|entry| entry.value().clone())
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    /// Sorted action names.
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Sorted condition names.
    pub fn condition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.conditions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve `call.params` against the context and evaluate the condition.
    pub async fn check(
        &self,
        call: &ConditionCall,
        ctx: &ExecutionContext,
    ) -> Result<bool, InvokeError> {
        let condition = self
            .condition(&call.condition)
            .ok_or_else(|| InvokeError::NotRegistered {
                kind: ResourceKind::Condition,
                name: call.condition.clone(),
            })?;
        let params = ctx.resolve(&call.params).await;
        Ok(condition.evaluate(ctx, params).await?)
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::definition(format!("{kind} name must not be empty")));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(EngineError::definition(format!(
            "{kind} name '{name}' must not contain whitespace"
        )));
    }
    Ok(())
}

fn validate_inputs(name: &str, inputs: &[String]) -> Result<(), EngineError> {
    let mut seen = std::collections::HashSet::new();
    for input in inputs {
        if input.trim().is_empty() {
            return Err(EngineError::definition(format!(
                "'{name}' declares an empty input name"
            )));
        }
        if !seen.insert(input.as_str()) {
            return Err(EngineError::definition(format!(
                "'{name}' declares input '{input}' twice"
            )));
        }
    }
    Ok(())
}

fn insert_unique<T>(
    table: &DashMap<String, T>,
    kind: &str,
    name: String,
    value: T,
) -> Result<(), EngineError> {
    match table.entry(name) {
        Entry::Occupied(entry) => Err(EngineError::definition(format!(
            "{kind} '{}' is already registered",
            entry.key()
        ))),
        Entry::Vacant(entry) => {
            tracing::debug!(kind, name = entry.key().as_str(), "registered");
            entry.insert(value);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
