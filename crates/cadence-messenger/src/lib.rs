//! Message transport, retry and dead-letter handling for Cadence.
//!
//! This crate provides:
//! - `JobMessage` envelopes with string headers (retry count, trace id, queue)
//! - Transports: async queues (in-memory, SQLite) and an inline sync transport
//! - A consumer `Worker` that applies a pluggable retry policy and persists
//!   messages that exhaust their attempts as `FailedMessageRecord`s
//! - Operator replay of failed messages
//! - Lifecycle `Event`s routed through an explicit dispatch table

pub mod db;
mod envelope;
mod error;
pub mod events;
pub mod failed;
mod handler;
pub mod migrations;
mod rate_limit;
pub mod retry;
pub mod transport;
mod worker;

pub use envelope::{Headers, JobMessage, ReceivedMessage, header, validate_queue_name};
pub use error::MessengerError;
pub use events::{
    Event, EventDispatcher, EventDispatcherBuilder, EventKind, EventListener, SkipReason,
    TracingListener,
};
pub use failed::{
    FailedMessageFilter, FailedMessageRecord, FailedMessageReplayer, FailedMessageStore,
    MemoryFailedMessageStore, NewFailedMessage, ReplayOutcome, SqliteFailedMessageStore,
};
pub use handler::{HandlerError, HandlerRegistry, LogMessageHandler, MessageHandler};
pub use migrations::{MIGRATIONS, Migration, MigrationStatus, Migrator};
pub use rate_limit::RateLimiter;
pub use retry::{MultiplierRetryStrategy, RetryStrategy};
pub use transport::{InMemoryTransport, Receiver, SqliteTransport, SyncTransport, Transport};
pub use worker::{Worker, WorkerConfig, WorkerOutcome};

/// Queue used when a message does not name one.
pub const DEFAULT_QUEUE: &str = "default";
