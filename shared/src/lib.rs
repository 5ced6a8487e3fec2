//! Shared data structures and utilities for the task scheduling service
//!
//! This crate contains the task/bot entity types, capability sets,
//! configuration structures and utilities used by the scheduler server and
//! by API clients.

pub mod api;
pub mod capabilities;
pub mod config;
pub mod defaults;
pub mod tasks;
pub mod utils;

// Re-export commonly used types for convenience
pub use capabilities::CapabilitySet;
pub use config::{MachineTypeConfig, SchedulerConfig};
pub use tasks::{ResultSummary, RunResult, TaskRequest, TaskSlice, TaskState, TaskToRun};
pub use utils::{format_run_id, format_task_id, parse_run_id, parse_task_id};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Caller-observable error categories for the scheduling service
///
/// Each variant maps to a distinct recovery policy: validation and
/// authorization failures are permanent, transaction conflicts and transient
/// provider/notification failures are retried on the caller's next tick, and
/// bot misbehavior rejects the update without mutating any state.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Bot misbehavior: {0}")]
    BotMisbehavior(String),

    #[error("Provider transient error: {0}")]
    ProviderTransient(String),

    #[error("Provider permanent error: {0}")]
    ProviderPermanent(String),

    #[error("Notification transient error: {0}")]
    NotificationTransient(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests;
