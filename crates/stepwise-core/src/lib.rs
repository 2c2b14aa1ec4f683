//! Business logic for the Stepwise workflow engine.
//!
//! This crate holds the engine itself -- registry, execution context, step
//! runner, instance supervision, and trigger binding. It depends only on
//! `stepwise-types` and never touches the filesystem or network.

pub mod event;
pub mod workflow;

pub use event::EventBus;
pub use workflow::context::{ExecutionContext, TriggerOrigin};
pub use workflow::definition::validate_workflow;
pub use workflow::error::{EngineError, ResourceKind};
pub use workflow::executor::{Engine, ExecuteOptions};
pub use workflow::registry::{
    Action, ActionDefinition, ActionError, Condition, ConditionDefinition, InvokeError, Registry,
    TriggerDefinition,
};
pub use workflow::trigger::{TriggerBinder, TriggerListener};
