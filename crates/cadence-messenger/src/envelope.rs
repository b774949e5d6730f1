//! Job message envelope.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MessengerError;
use crate::db::{format_timestamp, parse_timestamp};

/// Message headers, ordered so the serialized form is stable.
pub type Headers = BTreeMap<String, String>;

/// Maximum length of a queue name (matches the storage column).
const MAX_QUEUE_NAME_LEN: usize = 190;

/// Well-known header names.
pub mod header {
    /// Message kind, used to route the message to a handler.
    pub const KIND: &str = "x-message-kind";
    /// Number of failed handling attempts so far.
    pub const RETRY_COUNT: &str = "x-retry-count";
    /// Trace identifier shared by every redelivery of a logical message.
    pub const TRACE_ID: &str = "x-trace-id";
    /// Queue the message was addressed to.
    pub const TARGET_QUEUE: &str = "x-target-queue";
    /// Error reported by the most recent failed attempt.
    pub const LAST_ERROR: &str = "x-last-error";
    /// Earliest redelivery time assigned by the most recent retry.
    pub const AVAILABLE_AT: &str = "x-available-at";
    /// Id of the failed message record this message was replayed from.
    pub const REDELIVERED_FROM: &str = "x-redelivered-from";
    /// Schedule that produced the message.
    pub const SCHEDULE_KEY: &str = "x-schedule-key";
    /// Occurrence the scheduled message stands for.
    pub const SCHEDULED_AT: &str = "x-scheduled-at";
}

/// A message handed to a transport.
///
/// Owned by the transport from `send` until it is delivered to exactly one
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Opaque payload.
    pub body: String,
    /// String headers (retry count, trace id, target queue, ...).
    pub headers: Headers,
    /// Queue the message is stored in.
    pub queue_name: String,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl JobMessage {
    /// Create a new message of the given kind with a fresh trace id.
    pub fn new(
        kind: impl Into<String>,
        body: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        let queue_name = queue_name.into();
        let mut headers = Headers::new();
        headers.insert(header::KIND.to_string(), kind.into());
        headers.insert(header::TRACE_ID.to_string(), Uuid::new_v4().to_string());
        headers.insert(header::TARGET_QUEUE.to_string(), queue_name.clone());

        Self {
            body: body.into(),
            headers,
            queue_name,
            created_at: Utc::now(),
        }
    }

    /// Rebuild a message from stored columns.
    pub fn from_parts(
        body: String,
        headers_json: &str,
        queue_name: String,
        created_at: DateTime<Utc>,
    ) -> Result<Self, MessengerError> {
        Ok(Self {
            body,
            headers: serde_json::from_str(headers_json)?,
            queue_name,
            created_at,
        })
    }

    /// Set the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Message kind used for handler routing.
    pub fn kind(&self) -> Option<&str> {
        self.header(header::KIND)
    }

    /// Trace id shared by all redeliveries.
    pub fn trace_id(&self) -> Option<&str> {
        self.header(header::TRACE_ID)
    }

    /// Number of failed attempts recorded in the headers.
    ///
    /// A missing or malformed header counts as zero.
    pub fn retry_count(&self) -> u32 {
        self.header(header::RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Return a copy with the retry counter set.
    pub fn with_retry_count(self, count: u32) -> Self {
        self.with_header(header::RETRY_COUNT, count.to_string())
    }

    /// Redelivery time assigned by the previous retry, if any.
    pub fn last_available_at(&self) -> Option<DateTime<Utc>> {
        self.header(header::AVAILABLE_AT)
            .and_then(|v| parse_timestamp("x-available-at", v).ok())
    }

    /// Record the redelivery time assigned by a retry.
    pub fn with_available_at(self, at: DateTime<Utc>) -> Self {
        self.with_header(header::AVAILABLE_AT, format_timestamp(at))
    }

    /// Look up a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Return a copy with the header set.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// Return a copy without the header.
    pub fn without_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    /// Serialize the headers for storage.
    pub fn headers_json(&self) -> Result<String, MessengerError> {
        Ok(serde_json::to_string(&self.headers)?)
    }
}

/// A message delivered to a consumer by a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Transport-assigned id, used to ack or reject.
    pub id: u64,
    /// The message itself.
    pub message: JobMessage,
    /// When the message became available.
    pub available_at: DateTime<Utc>,
}

/// Check that a queue name fits the storage column.
pub fn validate_queue_name(name: &str) -> Result<(), MessengerError> {
    if name.is_empty() || name.chars().count() > MAX_QUEUE_NAME_LEN {
        return Err(MessengerError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}
