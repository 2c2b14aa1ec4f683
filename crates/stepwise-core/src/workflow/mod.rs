//! Workflow engine core.
//!
//! - `registry` -- named actions, conditions, and trigger definitions
//! - `context` -- per-instance data bag and `{{ path }}` template resolution
//! - `definition` -- structural validation of workflow registrations
//! - `step_runner` -- interprets action/condition/parallel/loop/switch steps
//! - `retry` -- retry policy for failing action steps
//! - `instance` -- shared per-instance state (record, timer, concurrency slot)
//! - `executor` -- the `Engine`: admission, timeout race, stop, stats, cleanup
//! - `trigger` -- event-name listeners that launch bound workflows

pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub(crate) mod instance;
pub mod registry;
pub mod retry;
pub(crate) mod step_runner;
pub mod trigger;
