//! Message transports.
//!
//! A [`Transport`] accepts messages from producers; a [`Receiver`] hands
//! them to consumers. Async transports return from `send` once the message
//! is persisted, not once it is processed. [`SyncTransport`] runs the
//! handler inline instead.

mod memory;
mod sqlite;
mod sync;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{JobMessage, MessengerError, ReceivedMessage};

pub use memory::InMemoryTransport;
pub use sqlite::SqliteTransport;
pub use sync::SyncTransport;

/// Producer side of a message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand a message to the transport for delivery no earlier than
    /// `available_at`.
    ///
    /// Returns once the transport has accepted the message. An
    /// `available_at` before the message's creation time is treated as
    /// the creation time.
    async fn send_at(
        &self,
        message: JobMessage,
        available_at: DateTime<Utc>,
    ) -> Result<(), MessengerError>;

    /// Hand a message to the transport for immediate delivery.
    async fn send(&self, message: JobMessage) -> Result<(), MessengerError> {
        let available_at = message.created_at;
        self.send_at(message, available_at).await
    }
}

/// Consumer side of an asynchronous transport.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Claim the oldest message available at `now` on any of `queues`.
    ///
    /// A claimed message is invisible to other receivers until it is acked
    /// or rejected.
    async fn receive(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<ReceivedMessage>, MessengerError>;

    /// Acknowledge a claimed message, removing it from the transport.
    async fn ack(&self, id: u64) -> Result<(), MessengerError>;

    /// Drop a claimed message without handling it.
    async fn reject(&self, id: u64) -> Result<(), MessengerError>;
}

/// The effective delivery time for a message.
fn effective_available_at(message: &JobMessage, available_at: DateTime<Utc>) -> DateTime<Utc> {
    available_at.max(message.created_at)
}
