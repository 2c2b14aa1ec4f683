//! CLI workflow subcommands.
//!
//! Provides validate, run, fire, and builtins. Each command builds a fresh
//! engine from the loaded config, so nothing persists between invocations.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use stepwise_core::{Engine, ExecuteOptions, ExecutionContext, Registry, TriggerDefinition};
use stepwise_infra::builtin::{describe_builtins, register_builtins};
use stepwise_infra::workflow_file::{discover_workflows, load_workflow_file};
use stepwise_types::config::StepwiseConfig;
use stepwise_types::instance::{InstanceFilter, InstanceStatus, StepRecord, StepStatus, WorkflowInstance};
use stepwise_types::workflow::{StepKind, StepNode};

// ---------------------------------------------------------------------------
// Engine setup
// ---------------------------------------------------------------------------

/// Engine with built-ins and the config file's trigger declarations.
pub(crate) fn build_engine(config: &StepwiseConfig) -> Result<Engine> {
    let engine = Engine::new(config.engine.clone());
    register_builtins(engine.registry()).context("Failed to register built-ins")?;
    for declaration in &config.triggers {
        engine
            .register_trigger(
                declaration.name.clone(),
                TriggerDefinition::new(declaration.events.clone()),
            )
            .with_context(|| format!("Invalid trigger '{}' in config", declaration.name))?;
    }
    Ok(engine)
}

fn parse_json_arg(raw: Option<&str>, flag: &str) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid JSON in {flag}")),
        None => Ok(Value::Null),
    }
}

/// Total number of step nodes, nested ones included.
fn count_steps(steps: &[StepNode]) -> usize {
    steps
        .iter()
        .map(|step| {
            1 + match &step.kind {
                StepKind::Action { .. } | StepKind::Condition { .. } => 0,
                StepKind::Parallel { steps } | StepKind::Loop { steps, .. } => count_steps(steps),
                StepKind::Switch { cases, default, .. } => {
                    cases.iter().map(|c| count_steps(&c.steps)).sum::<usize>()
                        + default.as_deref().map(count_steps).unwrap_or(0)
                }
            }
        })
        .sum()
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let workflow = load_workflow_file(file)
        .with_context(|| format!("Workflow file {} is not valid", file.display()))?;
    let definition = &workflow.definition;
    let trigger = definition.trigger.as_ref().map(|b| b.trigger.as_str());

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": workflow.id,
            "name": definition.name,
            "steps": definition.steps.len(),
            "total_steps": count_steps(&definition.steps),
            "trigger": trigger,
            "enabled": definition.enabled,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("*").green().bold(),
        style(&workflow.id).cyan()
    );
    println!("  Name: {}", definition.name);
    println!(
        "  Steps: {} top-level, {} total",
        definition.steps.len(),
        count_steps(&definition.steps)
    );
    println!("  Trigger: {}", trigger.unwrap_or("-"));
    if !definition.enabled {
        println!("  {}", style("Disabled").yellow());
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    config: &StepwiseConfig,
    file: &Path,
    data: Option<&str>,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<()> {
    let workflow = load_workflow_file(file)
        .with_context(|| format!("Failed to load workflow {}", file.display()))?;
    let engine = build_engine(config)?;

    // Direct runs do not listen for events
    let mut definition = workflow.definition;
    if let Some(binding) = definition.trigger.take() {
        tracing::debug!(trigger = %binding.trigger, "ignoring trigger binding for direct run");
    }
    engine
        .register_workflow(&workflow.id, definition)
        .with_context(|| format!("Failed to register workflow '{}'", workflow.id))?;

    let ctx = ExecutionContext::from_value(parse_json_arg(data, "--data")?);
    let mut options = ExecuteOptions::default();
    if let Some(ms) = timeout_ms {
        options = options.with_timeout_ms(ms);
    }

    let outcome = engine.execute_workflow(&workflow.id, ctx, options).await;
    let instance_id = match &outcome {
        Ok(result) => Some(result.instance_id),
        Err(err) => err.instance_id(),
    };
    let instance = match instance_id {
        Some(id) => engine.get_instance(id).await,
        None => None,
    };
    engine.shutdown().await;

    match outcome {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if let Some(instance) = &instance {
                print_instance(instance);
            }
            Ok(())
        }
        Err(err) => {
            if json {
                let out = serde_json::json!({
                    "error": err.to_string(),
                    "instance": instance,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if let Some(instance) = &instance {
                print_instance(instance);
            }
            Err(anyhow::Error::new(err)
                .context(format!("Workflow '{}' did not complete", workflow.id)))
        }
    }
}

// ---------------------------------------------------------------------------
// Fire
// ---------------------------------------------------------------------------

pub async fn handle_fire(
    config: &StepwiseConfig,
    dir: &Path,
    event: &str,
    payload: Option<&str>,
    json: bool,
) -> Result<()> {
    let payload = parse_json_arg(payload, "--payload")?;
    let files = discover_workflows(dir)
        .with_context(|| format!("Failed to read workflows from {}", dir.display()))?;
    if files.is_empty() {
        bail!("No workflow files found in {}", dir.display());
    }

    let engine = build_engine(config)?;
    let mut registered = 0;
    for (path, file) in files {
        match engine.register_workflow(&file.id, file.definition) {
            Ok(_) => registered += 1,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping workflow");
            }
        }
    }

    let dispatched = engine.emit(event, payload);
    engine.wait_for_dispatches().await;

    let instances = engine.list_instances(&InstanceFilter::default()).await;
    let stats = engine.get_stats();

    let retention = Duration::from_millis(config.engine.instance_retention_ms);
    let removed = engine.cleanup_instances(retention).await;
    tracing::debug!(removed, "instance cleanup");
    engine.shutdown().await;

    if json {
        let out = serde_json::json!({
            "event": event,
            "registered": registered,
            "dispatched": dispatched,
            "instances": instances,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if dispatched == 0 {
        println!(
            "  No workflow listens on '{}' ({} registered).",
            style(event).cyan(),
            registered
        );
        println!(
            "  Declare it with: {}",
            style("[[triggers]] name = \"...\" events = [\"...\"]").dim()
        );
        println!();
        return Ok(());
    }

    println!(
        "  {} Delivered '{}' to {} workflow(s)",
        style("*").green().bold(),
        style(event).cyan(),
        dispatched
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);
    for instance in &instances {
        table.add_row(vec![
            Cell::new(short_id(instance)),
            Cell::new(&instance.workflow_id),
            format_instance_status(instance.status),
            Cell::new(instance.steps.len()),
            Cell::new(format_duration(instance.duration_ms())),
            Cell::new(instance.error.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
    println!();
    println!(
        "  Completed: {}  Failed: {}  Stopped: {}  Avg duration: {}ms",
        style(stats.completed).green(),
        style(stats.failed).red(),
        stats.stopped,
        stats.average_duration_ms
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

pub fn handle_builtins(json: bool) -> Result<()> {
    let registry = Registry::new();
    register_builtins(&registry).context("Failed to register built-ins")?;
    let builtins = describe_builtins(&registry);

    if json {
        println!("{}", serde_json::to_string_pretty(&builtins)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Inputs"),
        ]);
    for (name, info) in &builtins {
        let inputs = info["inputs"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(name),
            Cell::new(info["kind"].as_str().unwrap_or("-")),
            Cell::new(inputs),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_instance(instance: &WorkflowInstance) {
    println!();
    println!(
        "  {} {} ({})",
        style("Workflow:").bold(),
        style(&instance.workflow_id).cyan(),
        short_id(instance)
    );
    println!("  Status: {}", instance.status);
    println!("  Duration: {}", format_duration(instance.duration_ms()));
    if let Some(err) = &instance.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    if instance.steps.is_empty() {
        println!("  No steps recorded.");
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Path").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Output / Error"),
        ]);
    for record in &instance.steps {
        table.add_row(vec![
            Cell::new(&record.path),
            Cell::new(format!("{}{}", "  ".repeat(record.depth), record.step)),
            Cell::new(record.step_type),
            format_step_status(record.status),
            Cell::new(record.attempts),
            Cell::new(format_duration(step_duration_ms(record))),
            Cell::new(step_detail(record)),
        ]);
    }
    println!("{table}");
    println!();
}

fn short_id(instance: &WorkflowInstance) -> String {
    instance.id.to_string().chars().take(8).collect()
}

fn step_duration_ms(record: &StepRecord) -> Option<u64> {
    record
        .completed_at
        .map(|end| (end - record.started_at).num_milliseconds().max(0) as u64)
}

fn step_detail(record: &StepRecord) -> String {
    if let Some(err) = &record.error {
        return err.clone();
    }
    match &record.output {
        Some(output) => truncate(&output.to_string(), 48),
        None => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn format_duration(ms: Option<u64>) -> String {
    ms.map(|ms| format!("{ms}ms")).unwrap_or_else(|| "-".to_string())
}

fn format_step_status(status: StepStatus) -> Cell {
    match status {
        StepStatus::Running => Cell::new("running").fg(Color::Blue),
        StepStatus::Completed => Cell::new("completed").fg(Color::Green),
        StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        StepStatus::Skipped => Cell::new("skipped").fg(Color::DarkYellow),
    }
}

fn format_instance_status(status: InstanceStatus) -> Cell {
    match status {
        InstanceStatus::Running => Cell::new("running").fg(Color::Blue),
        InstanceStatus::Completed => Cell::new("completed").fg(Color::Green),
        InstanceStatus::Failed => Cell::new("failed").fg(Color::Red),
        InstanceStatus::Stopped => Cell::new("stopped").fg(Color::DarkYellow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::config::TriggerDeclaration;
    use tempfile::TempDir;

    const COUNTER_YAML: &str = r#"
name: Counter
variables:
  n: 0
trigger:
  trigger: orders
  condition: { condition: equals, params: { left: "{{ status }}", right: paid } }
steps:
  - kind: loop
    while: { condition: less_than, params: { left: "{{ n }}", right: 2 } }
    steps:
      - kind: action
        action: increment
        params: { name: n }
  - kind: switch
    value: "{{ status }}"
    cases:
      - value: paid
        steps:
          - kind: action
            action: log
            params: { message: "paid {{ n }}" }
"#;

    fn config_with_orders() -> StepwiseConfig {
        StepwiseConfig {
            triggers: vec![TriggerDeclaration {
                name: "orders".to_string(),
                events: vec!["order.paid".to_string()],
            }],
            ..StepwiseConfig::default()
        }
    }

    #[test]
    fn counts_nested_steps() {
        let steps = vec![
            StepNode::loop_once(vec![StepNode::action("a", json!({}))]),
            StepNode::parallel(vec![
                StepNode::action("b", json!({})),
                StepNode::action("c", json!({})),
            ]),
        ];
        assert_eq!(count_steps(&steps), 5);
    }

    #[test]
    fn parse_json_arg_rejects_garbage() {
        assert_eq!(parse_json_arg(None, "--data").unwrap(), Value::Null);
        assert_eq!(parse_json_arg(Some(r#"{"a":1}"#), "--data").unwrap(), json!({ "a": 1 }));
        assert!(parse_json_arg(Some("{nope"), "--data").is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }

    #[tokio::test]
    async fn build_engine_registers_config_triggers() {
        let engine = build_engine(&config_with_orders()).unwrap();
        let stats = engine.get_stats();
        assert_eq!(stats.registered_triggers, 1);
        assert_eq!(stats.registered_actions, 6);

        let bad = StepwiseConfig {
            triggers: vec![TriggerDeclaration {
                name: "empty".to_string(),
                events: vec![],
            }],
            ..StepwiseConfig::default()
        };
        assert!(build_engine(&bad).is_err());
    }

    #[tokio::test]
    async fn run_executes_a_workflow_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("counter.yaml");
        std::fs::write(&path, COUNTER_YAML).unwrap();

        let config = StepwiseConfig::default();
        handle_run(&config, &path, Some(r#"{"status":"paid"}"#), None, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_reports_a_failing_workflow() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("boom.yaml");
        std::fs::write(
            &path,
            "name: Boom\nsteps:\n  - kind: action\n    action: fail\n    params: { message: broken }\n",
        )
        .unwrap();

        let err = handle_run(&StepwiseConfig::default(), &path, None, None, true)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
    }

    #[tokio::test]
    async fn fire_delivers_to_bound_workflows() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("counter.yaml"), COUNTER_YAML).unwrap();

        handle_fire(
            &config_with_orders(),
            tmp.path(),
            "order.paid",
            Some(r#"{"status":"paid"}"#),
            true,
        )
        .await
        .unwrap();

        let empty = TempDir::new().unwrap();
        assert!(
            handle_fire(&config_with_orders(), empty.path(), "order.paid", None, true)
                .await
                .is_err()
        );
    }

    #[test]
    fn validate_and_builtins_succeed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("counter.yaml");
        std::fs::write(&path, COUNTER_YAML).unwrap();
        handle_validate(&path, true).unwrap();
        handle_builtins(true).unwrap();
    }
}
