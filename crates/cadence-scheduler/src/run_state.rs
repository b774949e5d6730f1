//! Per-schedule record of the last claimed run.
//!
//! `set` never moves a key backwards: the stored value is the maximum of
//! every value written for it.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use cadence_messenger::db::{self, format_timestamp};

use crate::SchedulerError;
use crate::store::{lock_conn, parse_time};

/// Shared store of `last_claimed_at` per schedule key.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, SchedulerError>;

    /// Record a claim. Returns the stored value, which is never earlier
    /// than what was there before.
    async fn set(&self, key: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError>;

    /// Forget a key (administrative reset).
    async fn reset(&self, key: &str) -> Result<(), SchedulerError>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryRunStateStore {
    claims: DashMap<String, DateTime<Utc>>,
}

impl MemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(self.claims.get(key).map(|entry| *entry))
    }

    async fn set(&self, key: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let mut entry = self.claims.entry(key.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(*entry)
    }

    async fn reset(&self, key: &str) -> Result<(), SchedulerError> {
        self.claims.remove(key);
        Ok(())
    }
}

/// Store in the `scheduler_run_state` table, shared by every process using
/// the same database file.
pub struct SqliteRunStateStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let conn = db::open(path).map_err(|e| SchedulerError::Store(e.to_string()))?;
        Self::new(conn)
    }

    pub fn new(conn: Connection) -> Result<Self, SchedulerError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduler_run_state (
                schedule_key TEXT PRIMARY KEY,
                last_claimed_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl RunStateStore for SqliteRunStateStore {
    async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let conn = lock_conn(&self.conn)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT last_claimed_at FROM scheduler_run_state WHERE schedule_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        value.map(|v| parse_time("last_claimed_at", &v)).transpose()
    }

    async fn set(&self, key: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let conn = lock_conn(&self.conn)?;

        // Fixed-width timestamps compare correctly as text
        conn.execute(
            "INSERT INTO scheduler_run_state (schedule_key, last_claimed_at) VALUES (?1, ?2)
             ON CONFLICT(schedule_key) DO UPDATE
             SET last_claimed_at = max(last_claimed_at, excluded.last_claimed_at)",
            params![key, format_timestamp(at)],
        )?;

        let stored: String = conn.query_row(
            "SELECT last_claimed_at FROM scheduler_run_state WHERE schedule_key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        parse_time("last_claimed_at", &stored)
    }

    async fn reset(&self, key: &str) -> Result<(), SchedulerError> {
        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "DELETE FROM scheduler_run_state WHERE schedule_key = ?1",
            params![key],
        )?;
        info!(schedule_key = key, "run state reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    async fn exercise(store: &dyn RunStateStore) {
        assert_eq!(store.get("daily-report").await.unwrap(), None);

        assert_eq!(store.set("daily-report", t(100)).await.unwrap(), t(100));
        assert_eq!(store.set("daily-report", t(50)).await.unwrap(), t(100));
        assert_eq!(store.get("daily-report").await.unwrap(), Some(t(100)));

        assert_eq!(store.set("daily-report", t(200)).await.unwrap(), t(200));
        assert_eq!(store.get("cleanup").await.unwrap(), None);

        store.reset("daily-report").await.unwrap();
        assert_eq!(store.get("daily-report").await.unwrap(), None);
        assert_eq!(store.set("daily-report", t(10)).await.unwrap(), t(10));
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryRunStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteRunStateStore::new(db::open_in_memory().unwrap()).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let a = SqliteRunStateStore::open(&path).unwrap();
        let b = SqliteRunStateStore::open(&path).unwrap();

        a.set("daily-report", t(300)).await.unwrap();
        assert_eq!(b.get("daily-report").await.unwrap(), Some(t(300)));
        assert_eq!(b.set("daily-report", t(1)).await.unwrap(), t(300));
    }

    proptest! {
        #[test]
        fn test_last_claimed_never_decreases(writes in prop::collection::vec(0i64..1_000_000, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let memory = MemoryRunStateStore::new();
            let sqlite = SqliteRunStateStore::new(db::open_in_memory().unwrap()).unwrap();

            let mut previous: Option<DateTime<Utc>> = None;
            for secs in writes {
                let (m, s) = runtime.block_on(async {
                    (
                        memory.set("k", t(secs)).await.unwrap(),
                        sqlite.set("k", t(secs)).await.unwrap(),
                    )
                });
                prop_assert_eq!(m, s);
                if let Some(previous) = previous {
                    prop_assert!(m >= previous);
                }
                prop_assert!(m >= t(secs));
                previous = Some(m);
            }
        }
    }
}
