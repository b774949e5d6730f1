//! Error types for the scheduler.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Cron expression could not be parsed.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// Schedule key already registered.
    #[error("schedule already exists: {0}")]
    DuplicateSchedule(String),

    /// Invalid schedule configuration.
    #[error("invalid schedule configuration: {0}")]
    InvalidConfig(String),

    /// The transport rejected a scheduled message.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] cadence_messenger::MessengerError),

    /// The transport did not answer within the dispatch timeout.
    #[error("dispatch timed out after {0:?}")]
    DispatchTimeout(Duration),

    /// The claim lock expired while dispatching.
    #[error("lost claim lock {0}")]
    LockLost(String),

    /// SQLite error in a shared store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Lock or run-state store failure.
    #[error("store error: {0}")]
    Store(String),
}
