//! Workflow definition types for Stepwise.
//!
//! A workflow is an ordered list of [`StepNode`]s. Each node is a tagged
//! variant (`action`, `condition`, `parallel`, `loop`, `switch`) plus the
//! common `guard` / `critical` / `output_variable` fields. The same shape is
//! used by YAML/JSON workflow files and by the programmatic builders below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default iteration cap for loop steps.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Case value that matches any switch input.
pub const SWITCH_WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// Workflow configuration (registration input)
// ---------------------------------------------------------------------------

/// Everything a caller supplies when registering a workflow.
///
/// Registration turns this into an immutable [`WorkflowDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered step list.
    pub steps: Vec<StepNode>,
    /// Optional binding to a registered trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerBinding>,
    /// Per-instance timeout in milliseconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Extra attempts granted to a failing action step.
    #[serde(default)]
    pub retry_attempts: u32,
    /// Seed values for the instance's context data.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Disabled workflows reject execution.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowConfig {
    /// Create an enabled workflow config with the given steps.
    pub fn new(name: impl Into<String>, steps: Vec<StepNode>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            trigger: None,
            timeout_ms: None,
            retry_attempts: 0,
            variables: Map::new(),
            enabled: true,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerBinding) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow definition (registered, immutable)
// ---------------------------------------------------------------------------

/// A registered workflow.
///
/// Created or replaced by registration; never mutated in place. Re-registering
/// the same id produces a new definition with `version` incremented.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerBinding>,
    /// Effective timeout in milliseconds.
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub enabled: bool,
    /// Starts at 1, bumped on every re-registration.
    pub version: u32,
    pub registered_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Build a definition from registration input.
    pub fn from_config(
        id: impl Into<String>,
        config: WorkflowConfig,
        default_timeout_ms: u64,
        version: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: config.name,
            description: config.description,
            steps: config.steps,
            trigger: config.trigger,
            timeout_ms: config.timeout_ms.unwrap_or(default_timeout_ms),
            retry_attempts: config.retry_attempts,
            variables: config.variables,
            enabled: config.enabled,
            version,
            registered_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step nodes
// ---------------------------------------------------------------------------

/// One node of a workflow's step tree.
///
/// Flattened over [`StepKind`], so a YAML step reads:
/// ```yaml
/// - kind: action
///   action: send_message
///   params: { to: "{{ user.phone }}" }
///   critical: false
///   output_variable: receipt
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepNode {
    /// Optional label used in step records and events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Condition evaluated first; `false` records the step as skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<ConditionCall>,
    /// A failing critical step aborts its enclosing sequence.
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Context key that receives the step output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

fn default_critical() -> bool {
    true
}

/// Kind-specific payload of a step node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a registered action.
    Action {
        action: String,
        #[serde(default = "empty_params")]
        params: Value,
    },
    /// Evaluate a registered condition; the boolean is the step output.
    Condition {
        condition: String,
        #[serde(default = "empty_params")]
        params: Value,
    },
    /// Run every child concurrently with isolated outcomes.
    Parallel { steps: Vec<StepNode> },
    /// Repeat `steps` while the condition holds (once when absent).
    Loop {
        #[serde(default, rename = "while", skip_serializing_if = "Option::is_none")]
        while_condition: Option<ConditionCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        steps: Vec<StepNode>,
    },
    /// Pick the first case whose value equals the resolved `value`.
    Switch {
        value: Value,
        cases: Vec<SwitchCase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Vec<StepNode>>,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Action { .. } => StepType::Action,
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::Parallel { .. } => StepType::Parallel,
            StepKind::Loop { .. } => StepType::Loop,
            StepKind::Switch { .. } => StepType::Switch,
        }
    }
}

/// Discriminant of [`StepKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Condition,
    Parallel,
    Loop,
    Switch,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepType::Action => "action",
            StepType::Condition => "condition",
            StepType::Parallel => "parallel",
            StepType::Loop => "loop",
            StepType::Switch => "switch",
        };
        f.write_str(s)
    }
}

/// A reference to a registered condition plus its parameter template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionCall {
    pub condition: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

impl ConditionCall {
    pub fn new(condition: impl Into<String>, params: Value) -> Self {
        Self {
            condition: condition.into(),
            params,
        }
    }
}

/// One arm of a switch step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchCase {
    /// Literal compared against the switch input; `"*"` matches anything.
    pub value: Value,
    pub steps: Vec<StepNode>,
}

impl SwitchCase {
    pub fn new(value: Value, steps: Vec<StepNode>) -> Self {
        Self { value, steps }
    }

    /// Whether this case accepts the given switch input.
    pub fn matches(&self, input: &Value) -> bool {
        self.value.as_str() == Some(SWITCH_WILDCARD) || &self.value == input
    }
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

impl StepNode {
    fn from_kind(kind: StepKind) -> Self {
        Self {
            id: None,
            kind,
            guard: None,
            critical: true,
            output_variable: None,
        }
    }

    pub fn action(action: impl Into<String>, params: Value) -> Self {
        Self::from_kind(StepKind::Action {
            action: action.into(),
            params,
        })
    }

    pub fn condition(condition: impl Into<String>, params: Value) -> Self {
        Self::from_kind(StepKind::Condition {
            condition: condition.into(),
            params,
        })
    }

    pub fn parallel(steps: Vec<StepNode>) -> Self {
        Self::from_kind(StepKind::Parallel { steps })
    }

    /// Loop that re-evaluates `condition` before every iteration.
    pub fn loop_while(condition: ConditionCall, steps: Vec<StepNode>) -> Self {
        Self::from_kind(StepKind::Loop {
            while_condition: Some(condition),
            max_iterations: None,
            steps,
        })
    }

    /// Loop without a condition: runs its body once.
    pub fn loop_once(steps: Vec<StepNode>) -> Self {
        Self::from_kind(StepKind::Loop {
            while_condition: None,
            max_iterations: None,
            steps,
        })
    }

    pub fn switch(value: Value, cases: Vec<SwitchCase>, default: Option<Vec<StepNode>>) -> Self {
        Self::from_kind(StepKind::Switch {
            value,
            cases,
            default,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_guard(mut self, guard: ConditionCall) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn with_output(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }

    /// Override the iteration cap of a loop step. No-op for other kinds.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        if let StepKind::Loop { max_iterations, .. } = &mut self.kind {
            *max_iterations = Some(max);
        }
        self
    }

    /// Label used in records: explicit id, else the action/condition name,
    /// else the kind.
    pub fn label(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        match &self.kind {
            StepKind::Action { action, .. } => action.clone(),
            StepKind::Condition { condition, .. } => condition.clone(),
            other => other.step_type().to_string(),
        }
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

// ---------------------------------------------------------------------------
// Trigger binding
// ---------------------------------------------------------------------------

/// Binds a workflow to a registered trigger definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerBinding {
    /// Name of the registered trigger.
    pub trigger: String,
    /// Optional guard evaluated against the event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionCall>,
}

impl TriggerBinding {
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: ConditionCall) -> Self {
        self.condition = Some(condition);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_defaults_to_critical() {
        let step: StepNode = serde_json::from_value(json!({
            "kind": "action",
            "action": "send",
        }))
        .unwrap();
        assert!(step.critical);
        assert_eq!(step.kind, StepKind::Action {
            action: "send".to_string(),
            params: json!({}),
        });
    }

    #[test]
    fn loop_reads_while_keyword() {
        let step: StepNode = serde_json::from_value(json!({
            "kind": "loop",
            "while": { "condition": "truthy", "params": { "value": "{{ more }}" } },
            "steps": [{ "kind": "action", "action": "fetch" }],
        }))
        .unwrap();
        match step.kind {
            StepKind::Loop {
                while_condition,
                max_iterations,
                steps,
            } => {
                assert_eq!(while_condition.unwrap().condition, "truthy");
                assert!(max_iterations.is_none());
                assert_eq!(steps.len(), 1);
            }
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn yaml_workflow_parses_nested_steps() {
        let yaml = r#"
name: order-followup
timeout_ms: 5000
variables:
  greeting: hello
trigger:
  trigger: orders
  condition:
    condition: equals
    params: { left: "{{ status }}", right: paid }
steps:
  - kind: action
    id: notify
    action: send_message
    params:
      to: "{{ customer.phone }}"
    critical: false
    output_variable: receipt
  - kind: switch
    value: "{{ status }}"
    cases:
      - value: paid
        steps:
          - kind: action
            action: ship
    default:
      - kind: action
        action: hold
  - kind: parallel
    steps:
      - kind: action
        action: a
      - kind: condition
        condition: exists
"#;
        let config: WorkflowConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.name, "order-followup");
        assert_eq!(config.timeout_ms, Some(5000));
        assert!(config.enabled);
        assert_eq!(config.steps.len(), 3);
        assert!(!config.steps[0].critical);
        assert_eq!(config.steps[0].output_variable.as_deref(), Some("receipt"));
        assert_eq!(config.steps[1].step_type(), StepType::Switch);
        assert_eq!(config.steps[2].step_type(), StepType::Parallel);
        assert_eq!(config.trigger.unwrap().trigger, "orders");
    }

    #[test]
    fn label_prefers_id_then_name_then_kind() {
        assert_eq!(StepNode::action("send", json!({})).label(), "send");
        assert_eq!(
            StepNode::action("send", json!({})).with_id("first").label(),
            "first"
        );
        assert_eq!(StepNode::parallel(vec![]).label(), "parallel");
    }

    #[test]
    fn switch_case_wildcard_matches_anything() {
        let case = SwitchCase::new(json!("*"), vec![]);
        assert!(case.matches(&json!("x")));
        assert!(case.matches(&json!(42)));

        let literal = SwitchCase::new(json!("a"), vec![]);
        assert!(literal.matches(&json!("a")));
        assert!(!literal.matches(&json!("b")));
    }

    #[test]
    fn max_iterations_builder_only_touches_loops() {
        let step = StepNode::loop_once(vec![]).with_max_iterations(3);
        assert!(matches!(
            step.kind,
            StepKind::Loop {
                max_iterations: Some(3),
                ..
            }
        ));
        let action = StepNode::action("a", json!({})).with_max_iterations(3);
        assert!(matches!(action.kind, StepKind::Action { .. }));
    }

    #[test]
    fn definition_uses_default_timeout() {
        let config = WorkflowConfig::new("wf", vec![]);
        let def = WorkflowDefinition::from_config("wf-1", config, 30_000, 1);
        assert_eq!(def.timeout_ms, 30_000);
        assert_eq!(def.version, 1);

        let config = WorkflowConfig::new("wf", vec![]).with_timeout_ms(50);
        let def = WorkflowDefinition::from_config("wf-1", config, 30_000, 2);
        assert_eq!(def.timeout_ms, 50);
    }
}
