//! Infrastructure for Stepwise.
//!
//! - `config` -- `stepwise.toml` loader with default fallback
//! - `workflow_file` -- YAML/JSON workflow files and directory discovery
//! - `builtin` -- built-in actions and conditions

pub mod builtin;
pub mod config;
pub mod error;
pub mod workflow_file;

pub use error::InfraError;
