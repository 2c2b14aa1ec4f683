//! Built-in actions and conditions.
//!
//! Small, general-purpose building blocks for workflow files: variable
//! manipulation, delays, logging, and value comparisons. Parameters arrive
//! already resolved against the instance context, so `{{ path }}` templates
//! in a workflow file reach these implementations as concrete values.

use std::cmp::Ordering;
use std::time::Duration;

use serde_json::{Map, Number, Value, json};
use stepwise_core::{
    Action, ActionDefinition, ActionError, Condition, ConditionDefinition, EngineError,
    ExecutionContext, Registry,
};

/// Install every built-in action and condition into `registry`.
pub fn register_builtins(registry: &Registry) -> Result<(), EngineError> {
    registry.register_action(
        "set_variable",
        ActionDefinition::new(SetVariable).with_inputs(["name", "value"]),
    )?;
    registry.register_action(
        "increment",
        ActionDefinition::new(Increment).with_inputs(["name", "by"]),
    )?;
    registry.register_action(
        "append",
        ActionDefinition::new(Append).with_inputs(["name", "value"]),
    )?;
    registry.register_action("delay", ActionDefinition::new(Delay).with_inputs(["ms"]))?;
    registry.register_action(
        "log",
        ActionDefinition::new(Log).with_inputs(["message", "level"]),
    )?;
    registry.register_action("fail", ActionDefinition::new(Fail).with_inputs(["message"]))?;

    registry.register_condition(
        "equals",
        ConditionDefinition::new(Equals).with_inputs(["left", "right"]),
    )?;
    registry.register_condition(
        "not_equals",
        ConditionDefinition::new(NotEquals).with_inputs(["left", "right"]),
    )?;
    registry.register_condition(
        "exists",
        ConditionDefinition::new(Exists).with_inputs(["value"]),
    )?;
    registry.register_condition(
        "truthy",
        ConditionDefinition::new(Truthy).with_inputs(["value"]),
    )?;
    registry.register_condition(
        "greater_than",
        ConditionDefinition::new(GreaterThan).with_inputs(["left", "right"]),
    )?;
    registry.register_condition(
        "less_than",
        ConditionDefinition::new(LessThan).with_inputs(["left", "right"]),
    )?;

    tracing::debug!(
        actions = registry.action_count(),
        conditions = registry.condition_count(),
        "built-ins registered"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// `set_variable { name, value }`: writes `value` (null when absent) to `name`.
pub struct SetVariable;

impl Action for SetVariable {
    async fn execute(&self, ctx: &ExecutionContext, params: Value) -> Result<Value, ActionError> {
        let name = required_str(&params, "name")?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        ctx.set(name, value.clone()).await;
        Ok(value)
    }
}

/// `increment { name, by? }`: adds `by` (default 1) to a numeric variable.
///
/// An absent or null variable counts as 0. Integer arithmetic is kept while
/// both sides are integers and the sum fits in an `i64`.
pub struct Increment;

impl Action for Increment {
    async fn execute(&self, ctx: &ExecutionContext, params: Value) -> Result<Value, ActionError> {
        let name = required_str(&params, "name")?;
        let by = match params.get("by") {
            None | Some(Value::Null) => Value::from(1),
            Some(Value::Number(n)) => Value::Number(n.clone()),
            Some(other) => {
                return Err(ActionError::invalid_params(format!(
                    "'by' must be a number, got {other}"
                )));
            }
        };
        let current = match ctx.get(name).await {
            None | Some(Value::Null) => Value::from(0),
            Some(Value::Number(n)) => Value::Number(n),
            Some(other) => {
                return Err(ActionError::invalid_params(format!(
                    "variable '{name}' is not a number: {other}"
                )));
            }
        };

        let next = add_numbers(&current, &by)
            .ok_or_else(|| ActionError::failed(format!("cannot increment '{name}'")))?;
        ctx.set(name, next.clone()).await;
        Ok(next)
    }
}

fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Value::from(sum));
        }
    }
    let sum = a.as_f64()? + b.as_f64()?;
    Number::from_f64(sum).map(Value::Number)
}

/// `append { name, value }`: pushes onto an array variable, creating it when
/// absent. Outputs the new array.
pub struct Append;

impl Action for Append {
    async fn execute(&self, ctx: &ExecutionContext, params: Value) -> Result<Value, ActionError> {
        let name = required_str(&params, "name")?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        let mut items = match ctx.get(name).await {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ActionError::invalid_params(format!(
                    "variable '{name}' is not an array: {other}"
                )));
            }
        };
        items.push(value);
        let list = Value::Array(items);
        ctx.set(name, list.clone()).await;
        Ok(list)
    }
}

/// `delay { ms }`: sleeps.
pub struct Delay;

impl Action for Delay {
    async fn execute(&self, _ctx: &ExecutionContext, params: Value) -> Result<Value, ActionError> {
        let ms = params
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| ActionError::invalid_params("'ms' must be a non-negative integer"))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// `log { message, level? }`: emits a tracing event at `level` (default info).
pub struct Log;

impl Action for Log {
    async fn execute(&self, ctx: &ExecutionContext, params: Value) -> Result<Value, ActionError> {
        let message = match params.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
        let trigger = ctx.trigger().map(|origin| origin.event.as_str());

        match level {
            "trace" => tracing::trace!(trigger, "{message}"),
            "debug" => tracing::debug!(trigger, "{message}"),
            "info" => tracing::info!(trigger, "{message}"),
            "warn" => tracing::warn!(trigger, "{message}"),
            "error" => tracing::error!(trigger, "{message}"),
            other => {
                return Err(ActionError::invalid_params(format!("unknown log level '{other}'")));
            }
        }
        Ok(json!({ "message": message, "level": level }))
    }
}

/// `fail { message }`: always fails.
pub struct Fail;

impl Action for Fail {
    async fn execute(&self, _ctx: &ExecutionContext, params: Value) -> Result<Value, ActionError> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("fail action invoked");
        Err(ActionError::failed(message))
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// `equals { left, right }`. Numbers compare by value, so `1` equals `1.0`.
pub struct Equals;

impl Condition for Equals {
    async fn evaluate(&self, _ctx: &ExecutionContext, params: Value) -> Result<bool, ActionError> {
        Ok(loose_eq(operand(&params, "left"), operand(&params, "right")))
    }
}

pub struct NotEquals;

impl Condition for NotEquals {
    async fn evaluate(&self, _ctx: &ExecutionContext, params: Value) -> Result<bool, ActionError> {
        Ok(!loose_eq(operand(&params, "left"), operand(&params, "right")))
    }
}

/// `exists { value }`: the resolved value is present and not null.
pub struct Exists;

impl Condition for Exists {
    async fn evaluate(&self, _ctx: &ExecutionContext, params: Value) -> Result<bool, ActionError> {
        Ok(!operand(&params, "value").is_null())
    }
}

/// `truthy { value }`: false for null, `false`, 0, and the empty string.
pub struct Truthy;

impl Condition for Truthy {
    async fn evaluate(&self, _ctx: &ExecutionContext, params: Value) -> Result<bool, ActionError> {
        Ok(is_truthy(operand(&params, "value")))
    }
}

pub struct GreaterThan;

impl Condition for GreaterThan {
    async fn evaluate(&self, _ctx: &ExecutionContext, params: Value) -> Result<bool, ActionError> {
        Ok(compare(&params)? == Ordering::Greater)
    }
}

pub struct LessThan;

impl Condition for LessThan {
    async fn evaluate(&self, _ctx: &ExecutionContext, params: Value) -> Result<bool, ActionError> {
        Ok(compare(&params)? == Ordering::Less)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static NULL: Value = Value::Null;

fn operand<'a>(params: &'a Value, key: &str) -> &'a Value {
    params.get(key).unwrap_or(&NULL)
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ActionError::invalid_params(format!("'{key}' must be a non-empty string")))
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numeric view of a value; numeric strings count, since interpolated
/// templates produce strings.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(params: &Value) -> Result<Ordering, ActionError> {
    let left = operand(params, "left");
    let right = operand(params, "right");
    if let (Value::String(a), Value::String(b)) = (left, right) {
        if as_number(left).is_none() || as_number(right).is_none() {
            return Ok(a.cmp(b));
        }
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a
            .partial_cmp(&b)
            .ok_or_else(|| ActionError::invalid_params("operands are not comparable")),
        _ => Err(ActionError::invalid_params(format!(
            "cannot compare {left} with {right}"
        ))),
    }
}

/// Map of `name -> declared inputs` for every built-in, for listings.
pub fn describe_builtins(registry: &Registry) -> Map<String, Value> {
    let mut out = Map::new();
    for name in registry.action_names() {
        if let Some(def) = registry.action(&name) {
            out.insert(name, json!({ "kind": "action", "inputs": def.inputs }));
        }
    }
    for name in registry.condition_names() {
        if let Some(def) = registry.condition(&name) {
            out.insert(name, json!({ "kind": "condition", "inputs": def.inputs }));
        }
    }
    out
}
