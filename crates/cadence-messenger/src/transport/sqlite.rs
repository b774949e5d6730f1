//! Durable queue stored in a SQLite table.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use tracing::debug;

use super::{Receiver, Transport, effective_available_at};
use crate::db::{self, format_timestamp, parse_timestamp};
use crate::{JobMessage, MessengerError, ReceivedMessage, migrations, validate_queue_name};

/// Claims older than this are handed out again.
const DEFAULT_REDELIVER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Queue backed by the `messenger_messages` table.
///
/// Several processes can share one database file; a row is claimed by
/// setting `delivered_at` inside an immediate transaction, so exactly one
/// receiver gets it.
pub struct SqliteTransport {
    conn: Mutex<Connection>,
    redeliver_timeout: Duration,
}

impl SqliteTransport {
    /// Open the queue in a database file, applying pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MessengerError> {
        Self::new(db::open(path)?)
    }

    /// Wrap an existing connection, applying pending migrations.
    pub fn new(conn: Connection) -> Result<Self, MessengerError> {
        migrations::setup(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            redeliver_timeout: DEFAULT_REDELIVER_TIMEOUT,
        })
    }

    /// Set how long a claim may stay unacknowledged before redelivery.
    pub fn with_redeliver_timeout(mut self, timeout: Duration) -> Self {
        self.redeliver_timeout = timeout;
        self
    }

    /// Number of unclaimed messages across all queues.
    pub fn pending_count(&self) -> Result<u64, MessengerError> {
        let conn = db::lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messenger_messages WHERE delivered_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    async fn send_at(
        &self,
        message: JobMessage,
        available_at: DateTime<Utc>,
    ) -> Result<(), MessengerError> {
        validate_queue_name(&message.queue_name)?;
        let available_at = effective_available_at(&message, available_at);
        let headers = message.headers_json()?;

        let conn = db::lock(&self.conn)?;
        conn.execute(
            "INSERT INTO messenger_messages (body, headers, queue_name, created_at, available_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.body,
                headers,
                message.queue_name,
                format_timestamp(message.created_at),
                format_timestamp(available_at),
            ],
        )?;

        debug!(
            id = conn.last_insert_rowid(),
            queue = %message.queue_name,
            available_at = %available_at,
            "message enqueued"
        );
        Ok(())
    }
}

#[async_trait]
impl Receiver for SqliteTransport {
    async fn receive(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<ReceivedMessage>, MessengerError> {
        if queues.is_empty() {
            return Ok(None);
        }

        let redeliver_timeout = chrono::Duration::from_std(self.redeliver_timeout)
            .map_err(|e| MessengerError::Internal(e.to_string()))?;
        let stale_before = now - redeliver_timeout;

        let placeholders = (0..queues.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, body, headers, queue_name, created_at, available_at
             FROM messenger_messages
             WHERE queue_name IN ({})
               AND ((delivered_at IS NULL AND available_at <= ?1) OR delivered_at < ?2)
             ORDER BY available_at, id
             LIMIT 1",
            placeholders
        );

        let mut bindings = vec![format_timestamp(now), format_timestamp(stale_before)];
        bindings.extend(queues.iter().cloned());

        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(&sql, params_from_iter(bindings.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .optional()?;

        let Some((id, body, headers, queue_name, created_at, available_at)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE messenger_messages SET delivered_at = ?1 WHERE id = ?2",
            params![format_timestamp(now), id],
        )?;
        tx.commit()?;

        let created_at = parse_timestamp("created_at", &created_at)?;
        let message = JobMessage::from_parts(body, &headers, queue_name, created_at)?;

        Ok(Some(ReceivedMessage {
            id: id as u64,
            message,
            available_at: parse_timestamp("available_at", &available_at)?,
        }))
    }

    async fn ack(&self, id: u64) -> Result<(), MessengerError> {
        let conn = db::lock(&self.conn)?;
        conn.execute("DELETE FROM messenger_messages WHERE id = ?1", params![id as i64])?;
        Ok(())
    }

    async fn reject(&self, id: u64) -> Result<(), MessengerError> {
        self.ack(id).await
    }
}
