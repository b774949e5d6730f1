//! SQLite helpers shared by the persistent stores.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings with
//! microsecond precision, so comparing the text compares the instants.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::MessengerError;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) a database file shared between processes.
pub fn open(path: impl AsRef<Path>) -> Result<Connection, MessengerError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // Enable WAL mode so workers can read while the scheduler writes
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

    Ok(conn)
}

/// Open a private in-memory database.
pub fn open_in_memory() -> Result<Connection, MessengerError> {
    Ok(Connection::open_in_memory()?)
}

/// Format a timestamp for storage.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, MessengerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| MessengerError::InvalidTimestamp {
            column,
            value: value.to_string(),
        })
}

/// Lock a shared connection.
pub fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, MessengerError> {
    conn.lock()
        .map_err(|_| MessengerError::Internal("connection mutex poisoned".to_string()))
}
