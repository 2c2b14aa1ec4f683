//! Shared domain types for Stepwise.
//!
//! This crate contains the serializable types used across the engine:
//! workflow definitions and step nodes, instance records, lifecycle events,
//! and configuration.
//!
//! No async runtime here: only serde, serde_json, uuid, chrono.

pub mod config;
pub mod event;
pub mod instance;
pub mod workflow;
