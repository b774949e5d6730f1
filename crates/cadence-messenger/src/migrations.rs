//! Forward/backward schema migrations for the message bus tables.
//!
//! Every `up` is idempotent (`IF NOT EXISTS`) and every `down` drops what
//! its `up` created. Applied versions are recorded in `migration_versions`.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::MessengerError;
use crate::db::{format_timestamp, parse_timestamp};

/// Table holding messages that exhausted their retries.
pub const FAILED_MESSAGE_TABLE: &str = "message_bus_failed_messages";

/// Table backing the async SQLite transport.
pub const QUEUE_TABLE: &str = "messenger_messages";

/// A single schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Unique, sortable version name.
    pub version: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL applying the change.
    pub up: &'static str,
    /// SQL reverting the change.
    pub down: &'static str,
}

/// All migrations in application order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "Version20250000000000",
        description: "Add the table needed to track messages that were unable to be successfully processed by the message bus",
        up: "
            CREATE TABLE IF NOT EXISTS message_bus_failed_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                headers TEXT NOT NULL,
                queue_name TEXT NOT NULL CHECK (length(queue_name) <= 190),
                created_at TEXT NOT NULL,
                available_at TEXT NOT NULL CHECK (available_at >= created_at),
                delivered_at TEXT CHECK (delivered_at IS NULL OR delivered_at >= available_at)
            );
            CREATE INDEX IF NOT EXISTS idx_failed_messages_queue_name
                ON message_bus_failed_messages(queue_name);
            CREATE INDEX IF NOT EXISTS idx_failed_messages_available_at
                ON message_bus_failed_messages(available_at);
            CREATE INDEX IF NOT EXISTS idx_failed_messages_delivered_at
                ON message_bus_failed_messages(delivered_at);
        ",
        down: "DROP TABLE IF EXISTS message_bus_failed_messages;",
    },
    Migration {
        version: "Version20250000000001",
        description: "Add the queue table used by the asynchronous SQLite transport",
        up: "
            CREATE TABLE IF NOT EXISTS messenger_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                headers TEXT NOT NULL,
                queue_name TEXT NOT NULL CHECK (length(queue_name) <= 190),
                created_at TEXT NOT NULL,
                available_at TEXT NOT NULL,
                delivered_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messenger_messages_queue_name
                ON messenger_messages(queue_name);
            CREATE INDEX IF NOT EXISTS idx_messenger_messages_available_at
                ON messenger_messages(available_at);
            CREATE INDEX IF NOT EXISTS idx_messenger_messages_delivered_at
                ON messenger_messages(delivered_at);
        ",
        down: "DROP TABLE IF EXISTS messenger_messages;",
    },
];

/// Applied state of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: &'static str,
    pub description: &'static str,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Applies and reverts [`MIGRATIONS`] against a connection.
pub struct Migrator<'a> {
    conn: &'a Connection,
    migrations: &'static [Migration],
}

impl<'a> Migrator<'a> {
    /// Create a migrator, creating the bookkeeping table if needed.
    pub fn new(conn: &'a Connection) -> Result<Self, MessengerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migration_versions (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn,
            migrations: MIGRATIONS,
        })
    }

    fn applied_at(&self, version: &str) -> Result<Option<DateTime<Utc>>, MessengerError> {
        let applied: Option<String> = self
            .conn
            .query_row(
                "SELECT applied_at FROM migration_versions WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()?;
        applied
            .map(|text| parse_timestamp("applied_at", &text))
            .transpose()
    }

    /// Report every known migration and when it was applied.
    pub fn status(&self) -> Result<Vec<MigrationStatus>, MessengerError> {
        self.migrations
            .iter()
            .map(|m| {
                Ok(MigrationStatus {
                    version: m.version,
                    description: m.description,
                    applied_at: self.applied_at(m.version)?,
                })
            })
            .collect()
    }

    /// Apply all pending migrations in order.
    ///
    /// Returns the versions applied by this call.
    pub fn migrate_up(&self) -> Result<Vec<&'static str>, MessengerError> {
        let mut applied = Vec::new();

        for migration in self.migrations {
            if self.applied_at(migration.version)?.is_some() {
                continue;
            }

            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(migration.up)?;
            tx.execute(
                "INSERT INTO migration_versions (version, applied_at) VALUES (?1, ?2)",
                params![migration.version, format_timestamp(Utc::now())],
            )?;
            tx.commit()?;

            info!(version = migration.version, "applied migration");
            applied.push(migration.version);
        }

        Ok(applied)
    }

    /// Revert one applied migration.
    ///
    /// Returns false if the migration was not applied.
    pub fn migrate_down(&self, version: &str) -> Result<bool, MessengerError> {
        let migration = self
            .migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| MessengerError::Migration(format!("unknown migration: {}", version)))?;

        if self.applied_at(migration.version)?.is_none() {
            return Ok(false);
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(migration.down)?;
        tx.execute(
            "DELETE FROM migration_versions WHERE version = ?1",
            params![migration.version],
        )?;
        tx.commit()?;

        info!(version = migration.version, "reverted migration");
        Ok(true)
    }

    /// Revert the most recently applied migration, if any.
    pub fn rollback_last(&self) -> Result<Option<&'static str>, MessengerError> {
        for migration in self.migrations.iter().rev() {
            if self.migrate_down(migration.version)? {
                return Ok(Some(migration.version));
            }
        }
        Ok(None)
    }
}

/// Apply all pending migrations on a connection.
pub fn setup(conn: &Connection) -> Result<(), MessengerError> {
    Migrator::new(conn)?.migrate_up()?;
    Ok(())
}
