//! SQLite plumbing shared by the run-state store and the lock backend.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use cadence_messenger::db;

use crate::SchedulerError;

pub(crate) fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, SchedulerError> {
    db::lock(conn).map_err(|e| SchedulerError::Store(e.to_string()))
}

pub(crate) fn parse_time(column: &'static str, value: &str) -> Result<DateTime<Utc>, SchedulerError> {
    db::parse_timestamp(column, value).map_err(|e| SchedulerError::Store(e.to_string()))
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> Result<chrono::Duration, SchedulerError> {
    chrono::Duration::from_std(duration).map_err(|e| SchedulerError::Store(e.to_string()))
}
