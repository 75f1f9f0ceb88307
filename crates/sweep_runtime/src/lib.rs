//! Local host engine for `sweep_core` sweeps.
//!
//! This crate owns everything with side effects: child processes for jobs,
//! JSON files for persisted state and outcome records, the tracing
//! subscriber and the command-line entry point. The scheduling logic itself
//! stays in `sweep_core`.

pub mod adapters;
pub mod handlers;
pub mod telemetry;
