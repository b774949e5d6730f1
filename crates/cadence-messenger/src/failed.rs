//! Dead-letter store for messages that exhausted their retries.
//!
//! Records are append-only: the only mutation is setting `delivered_at`
//! once, after a successful replay. A failed replay inserts a new record
//! that points back at the original through `x-redelivered-from`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{self, format_timestamp, parse_timestamp};
use crate::{
    Event, EventDispatcher, HandlerRegistry, Headers, JobMessage, MessengerError, Transport,
    header, migrations, validate_queue_name,
};

/// A persisted dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMessageRecord {
    pub id: u64,
    pub body: String,
    pub headers: Headers,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    /// Earliest redelivery time.
    pub available_at: DateTime<Utc>,
    /// Set once the message was successfully redelivered.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl FailedMessageRecord {
    /// The stored message.
    pub fn message(&self) -> JobMessage {
        JobMessage {
            body: self.body.clone(),
            headers: self.headers.clone(),
            queue_name: self.queue_name.clone(),
            created_at: self.created_at,
        }
    }

    /// Error reported by the final failed attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.headers.get(header::LAST_ERROR).map(String::as_str)
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    /// A fresh message for redelivery: retry counter reset, linked back to
    /// this record.
    fn redelivery(&self, now: DateTime<Utc>) -> JobMessage {
        self.message()
            .without_header(header::RETRY_COUNT)
            .without_header(header::AVAILABLE_AT)
            .without_header(header::LAST_ERROR)
            .with_header(header::REDELIVERED_FROM, self.id.to_string())
            .with_created_at(now)
    }
}

/// Payload for inserting a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFailedMessage {
    pub body: String,
    pub headers: Headers,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

impl NewFailedMessage {
    /// Record `message` as failed at `now` with the terminal error.
    pub fn new(message: &JobMessage, error: &str, now: DateTime<Utc>) -> Self {
        let message = message.clone().with_header(header::LAST_ERROR, error);
        Self {
            body: message.body,
            headers: message.headers,
            queue_name: message.queue_name,
            created_at: now,
            available_at: now,
        }
    }
}

/// Which records `list` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedMessageFilter {
    pub queue_name: Option<String>,
    pub include_delivered: bool,
    pub limit: Option<usize>,
}

/// Durable storage for dead-lettered messages.
#[async_trait]
pub trait FailedMessageStore: Send + Sync {
    /// Insert a record. Safe under concurrent inserts.
    async fn insert(&self, new: NewFailedMessage) -> Result<FailedMessageRecord, MessengerError>;

    async fn get(&self, id: u64) -> Result<Option<FailedMessageRecord>, MessengerError>;

    /// Records ordered by id.
    async fn list(
        &self,
        filter: &FailedMessageFilter,
    ) -> Result<Vec<FailedMessageRecord>, MessengerError>;

    /// Set `delivered_at` on a record that has not been delivered yet.
    ///
    /// `at` is raised to the record's `available_at` if it is earlier.
    async fn mark_delivered(
        &self,
        id: u64,
        at: DateTime<Utc>,
    ) -> Result<FailedMessageRecord, MessengerError>;

    /// Number of records not yet delivered.
    async fn count_pending(&self) -> Result<u64, MessengerError>;
}

fn checked_times(new: &NewFailedMessage) -> Result<(DateTime<Utc>, DateTime<Utc>), MessengerError> {
    validate_queue_name(&new.queue_name)?;
    Ok((new.created_at, new.available_at.max(new.created_at)))
}

/// In-memory store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryFailedMessageStore {
    records: tokio::sync::Mutex<Vec<FailedMessageRecord>>,
}

impl MemoryFailedMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedMessageStore for MemoryFailedMessageStore {
    async fn insert(&self, new: NewFailedMessage) -> Result<FailedMessageRecord, MessengerError> {
        let (created_at, available_at) = checked_times(&new)?;
        let mut records = self.records.lock().await;

        let record = FailedMessageRecord {
            id: records.len() as u64 + 1,
            body: new.body,
            headers: new.headers,
            queue_name: new.queue_name,
            created_at,
            available_at,
            delivered_at: None,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: u64) -> Result<Option<FailedMessageRecord>, MessengerError> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn list(
        &self,
        filter: &FailedMessageFilter,
    ) -> Result<Vec<FailedMessageRecord>, MessengerError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| filter.include_delivered || !r.is_delivered())
            .filter(|r| {
                filter
                    .queue_name
                    .as_ref()
                    .is_none_or(|queue| &r.queue_name == queue)
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn mark_delivered(
        &self,
        id: u64,
        at: DateTime<Utc>,
    ) -> Result<FailedMessageRecord, MessengerError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(MessengerError::FailedMessageNotFound(id))?;

        if record.is_delivered() {
            return Err(MessengerError::AlreadyDelivered(id));
        }

        record.delivered_at = Some(at.max(record.available_at));
        Ok(record.clone())
    }

    async fn count_pending(&self) -> Result<u64, MessengerError> {
        let records = self.records.lock().await;
        Ok(records.iter().filter(|r| !r.is_delivered()).count() as u64)
    }
}

/// Store backed by the `message_bus_failed_messages` table.
pub struct SqliteFailedMessageStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str =
    "SELECT id, body, headers, queue_name, created_at, available_at, delivered_at
     FROM message_bus_failed_messages";

impl SqliteFailedMessageStore {
    /// Open the store in a database file, applying pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MessengerError> {
        Self::new(db::open(path)?)
    }

    /// Wrap an existing connection, applying pending migrations.
    pub fn new(conn: Connection) -> Result<Self, MessengerError> {
        migrations::setup(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get_with(conn: &Connection, id: u64) -> Result<Option<FailedMessageRecord>, MessengerError> {
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id as i64],
                StoredRow::from_row,
            )
            .optional()?;
        row.map(StoredRow::into_record).transpose()
    }
}

/// Raw column values, converted after the statement finishes.
struct StoredRow {
    id: i64,
    body: String,
    headers: String,
    queue_name: String,
    created_at: String,
    available_at: String,
    delivered_at: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            body: row.get(1)?,
            headers: row.get(2)?,
            queue_name: row.get(3)?,
            created_at: row.get(4)?,
            available_at: row.get(5)?,
            delivered_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<FailedMessageRecord, MessengerError> {
        Ok(FailedMessageRecord {
            id: self.id as u64,
            body: self.body,
            headers: serde_json::from_str(&self.headers)?,
            queue_name: self.queue_name,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            available_at: parse_timestamp("available_at", &self.available_at)?,
            delivered_at: self
                .delivered_at
                .map(|at| parse_timestamp("delivered_at", &at))
                .transpose()?,
        })
    }
}

#[async_trait]
impl FailedMessageStore for SqliteFailedMessageStore {
    async fn insert(&self, new: NewFailedMessage) -> Result<FailedMessageRecord, MessengerError> {
        let (created_at, available_at) = checked_times(&new)?;
        let headers = serde_json::to_string(&new.headers)?;

        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO message_bus_failed_messages
             (body, headers, queue_name, created_at, available_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.body,
                headers,
                new.queue_name,
                format_timestamp(created_at),
                format_timestamp(available_at),
            ],
        )?;
        let id = conn.last_insert_rowid() as u64;

        Self::get_with(&conn, id)?
            .ok_or_else(|| MessengerError::Internal(format!("inserted record {} vanished", id)))
    }

    async fn get(&self, id: u64) -> Result<Option<FailedMessageRecord>, MessengerError> {
        let conn = db::lock(&self.conn)?;
        Self::get_with(&conn, id)
    }

    async fn list(
        &self,
        filter: &FailedMessageFilter,
    ) -> Result<Vec<FailedMessageRecord>, MessengerError> {
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE (?1 OR delivered_at IS NULL)
               AND (?2 IS NULL OR queue_name = ?2)
             ORDER BY id
             LIMIT ?3",
            SELECT_COLUMNS
        ))?;

        let limit = filter.limit.map_or(-1, |l| l as i64);
        let rows = stmt
            .query_map(
                params![filter.include_delivered, filter.queue_name, limit],
                StoredRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(StoredRow::into_record).collect()
    }

    async fn mark_delivered(
        &self,
        id: u64,
        at: DateTime<Utc>,
    ) -> Result<FailedMessageRecord, MessengerError> {
        let conn = db::lock(&self.conn)?;
        let tx = conn.unchecked_transaction()?;

        let record = Self::get_with(&tx, id)?.ok_or(MessengerError::FailedMessageNotFound(id))?;
        if record.is_delivered() {
            return Err(MessengerError::AlreadyDelivered(id));
        }

        let delivered_at = at.max(record.available_at);
        tx.execute(
            "UPDATE message_bus_failed_messages SET delivered_at = ?1
             WHERE id = ?2 AND delivered_at IS NULL",
            params![format_timestamp(delivered_at), id as i64],
        )?;
        tx.commit()?;

        Ok(FailedMessageRecord {
            delivered_at: Some(delivered_at),
            ..record
        })
    }

    async fn count_pending(&self) -> Result<u64, MessengerError> {
        let conn = db::lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message_bus_failed_messages WHERE delivered_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Result of replaying a failed message inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The handler succeeded; the record is now marked delivered.
    Delivered(FailedMessageRecord),
    /// The handler failed again; the original is untouched and the new
    /// failure was recorded separately.
    Failed {
        original_id: u64,
        new_record: FailedMessageRecord,
    },
}

/// Operator-initiated redelivery of dead-lettered messages.
pub struct FailedMessageReplayer {
    store: Arc<dyn FailedMessageStore>,
    handlers: Arc<HandlerRegistry>,
    transport: Arc<dyn Transport>,
    events: Arc<EventDispatcher>,
}

impl FailedMessageReplayer {
    pub fn new(
        store: Arc<dyn FailedMessageStore>,
        handlers: Arc<HandlerRegistry>,
        transport: Arc<dyn Transport>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            store,
            handlers,
            transport,
            events,
        }
    }

    async fn pending_record(&self, id: u64) -> Result<FailedMessageRecord, MessengerError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(MessengerError::FailedMessageNotFound(id))?;
        if record.is_delivered() {
            return Err(MessengerError::AlreadyDelivered(id));
        }
        Ok(record)
    }

    /// Handle a failed message inline through the handler registry.
    #[tracing::instrument(skip(self))]
    pub async fn replay(&self, id: u64, now: DateTime<Utc>) -> Result<ReplayOutcome, MessengerError> {
        let record = self.pending_record(id).await?;
        let message = record.redelivery(now);

        match self.handlers.dispatch(&message).await {
            Ok(()) => {
                let delivered = self.store.mark_delivered(id, now).await?;
                self.events.dispatch(&Event::MessageHandled {
                    queue_name: message.queue_name.clone(),
                    message_id: id,
                    message,
                });
                info!(id, "replayed failed message");
                Ok(ReplayOutcome::Delivered(delivered))
            }
            Err(e) => {
                let error = e.to_string();
                let new_record = self
                    .store
                    .insert(NewFailedMessage::new(&message, &error, now))
                    .await?;
                self.events.dispatch(&Event::MessageFailed {
                    queue_name: message.queue_name.clone(),
                    message_id: id,
                    message,
                    error: error.clone(),
                    will_retry: false,
                });
                warn!(id, new_id = new_record.id, error = %error, "replay failed");
                Ok(ReplayOutcome::Failed {
                    original_id: id,
                    new_record,
                })
            }
        }
    }

    /// Send a failed message back through the transport.
    ///
    /// The record is marked delivered once the transport accepted the
    /// message; later failures go through the normal retry path.
    #[tracing::instrument(skip(self))]
    pub async fn requeue(
        &self,
        id: u64,
        now: DateTime<Utc>,
    ) -> Result<FailedMessageRecord, MessengerError> {
        let record = self.pending_record(id).await?;
        self.transport.send(record.redelivery(now)).await?;

        let delivered = self.store.mark_delivered(id, now).await?;
        info!(id, queue = %delivered.queue_name, "requeued failed message");
        Ok(delivered)
    }
}
