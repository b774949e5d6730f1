//! Error types for the message bus.

use thiserror::Error;

use crate::handler::HandlerError;

/// Errors that can occur in transport, store and worker operations.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Queue name is empty or longer than the storage column allows.
    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },

    /// Failed message record not found.
    #[error("failed message not found: {0}")]
    FailedMessageNotFound(u64),

    /// Failed message record has already been redelivered.
    #[error("failed message {0} was already delivered")]
    AlreadyDelivered(u64),

    /// No handler is registered for the message kind.
    #[error("no handler registered for message kind: {0}")]
    NoHandler(String),

    /// A handler invoked synchronously reported an error.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// The transport could not accept the message.
    #[error("transport unavailable: {0}")]
    Transport(String),

    /// Migration bookkeeping error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Internal error (poisoned lock and similar).
    #[error("internal error: {0}")]
    Internal(String),
}
