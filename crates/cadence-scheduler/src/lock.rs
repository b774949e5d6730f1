//! Advisory, expiring locks shared between scheduler processes.
//!
//! A [`LockBackend`] stores `key -> (holder token, expires_at)` with atomic
//! conditional writes. [`KeyedLock`] layers the acquire/refresh/release
//! protocol on top with a random holder token, so only the instance that
//! acquired a key can refresh or release it. A crashed holder's lock lapses
//! once its TTL passes.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};
use uuid::Uuid;

use cadence_messenger::db::{self, format_timestamp};

use crate::SchedulerError;
use crate::store::{lock_conn, to_chrono};

/// Interval between attempts of a blocking acquire.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Storage for lock ownership with atomic compare-and-set semantics.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take `key` for `token` if it is free, expired, or already held by
    /// `token`.
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, SchedulerError>;

    /// Extend the expiry, only while `token` still holds a live lock.
    async fn refresh(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, SchedulerError>;

    /// Drop the lock if `token` holds it.
    async fn release(&self, key: &str, token: &str) -> Result<(), SchedulerError>;

    /// Token of the live holder, if any.
    async fn holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, SchedulerError>;
}

/// A mutual-exclusion handle for one key.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Try to take the lock. Non-blocking attempts return immediately;
    /// blocking attempts retry until `timeout` elapses.
    async fn acquire(&mut self, blocking: bool, timeout: Duration) -> Result<bool, SchedulerError>;

    /// Extend the lock to `ttl` (or the current TTL) from now.
    ///
    /// Returns false, without error, if the lock was lost in the meantime.
    async fn refresh(&mut self, ttl: Option<Duration>) -> Result<bool, SchedulerError>;

    /// Release the lock. Releasing an unheld lock is a no-op.
    async fn release(&mut self) -> Result<(), SchedulerError>;

    /// Whether this handle still holds a live lock.
    async fn is_acquired(&self) -> Result<bool, SchedulerError>;

    fn ttl(&self) -> Duration;

    fn key(&self) -> &str;
}

/// Creates lock handles.
pub trait LockFactory: Send + Sync {
    fn make(&self, key: &str, ttl: Duration) -> Box<dyn Lock>;
}

/// [`Lock`] over any [`LockBackend`].
pub struct KeyedLock {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    ttl: Duration,
}

impl KeyedLock {
    pub fn new(backend: Arc<dyn LockBackend>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl,
        }
    }
}

#[async_trait]
impl Lock for KeyedLock {
    async fn acquire(&mut self, blocking: bool, timeout: Duration) -> Result<bool, SchedulerError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self
                .backend
                .try_acquire(&self.key, &self.token, Utc::now(), self.ttl)
                .await?
            {
                debug!(key = %self.key, "lock acquired");
                return Ok(true);
            }

            if !blocking || tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn refresh(&mut self, ttl: Option<Duration>) -> Result<bool, SchedulerError> {
        if let Some(ttl) = ttl {
            self.ttl = ttl;
        }

        let refreshed = self
            .backend
            .refresh(&self.key, &self.token, Utc::now(), self.ttl)
            .await?;
        if !refreshed {
            warn!(key = %self.key, "lock expired before refresh");
        }
        Ok(refreshed)
    }

    async fn release(&mut self) -> Result<(), SchedulerError> {
        self.backend.release(&self.key, &self.token).await
    }

    async fn is_acquired(&self) -> Result<bool, SchedulerError> {
        let holder = self.backend.holder(&self.key, Utc::now()).await?;
        Ok(holder.as_deref() == Some(self.token.as_str()))
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(&self) -> &str {
        &self.key
    }
}

/// Hands out [`KeyedLock`]s over a shared backend.
#[derive(Clone)]
pub struct BackendLockFactory {
    backend: Arc<dyn LockBackend>,
}

impl BackendLockFactory {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }
}

impl LockFactory for BackendLockFactory {
    fn make(&self, key: &str, ttl: Duration) -> Box<dyn Lock> {
        Box::new(KeyedLock::new(self.backend.clone(), key, ttl))
    }
}

#[derive(Debug, Clone)]
struct Holder {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Lock table in process memory; share one instance between engines to
/// get exclusion between them.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    locks: DashMap<String, Holder>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, SchedulerError> {
        let expires_at = now + to_chrono(ttl)?;

        match self.locks.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Holder {
                    token: token.to_string(),
                    expires_at,
                });
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.expires_at <= now || current.token == token {
                    entry.insert(Holder {
                        token: token.to_string(),
                        expires_at,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn refresh(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, SchedulerError> {
        let expires_at = now + to_chrono(ttl)?;

        match self.locks.get_mut(key) {
            Some(mut holder) if holder.token == token && holder.expires_at > now => {
                holder.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), SchedulerError> {
        self.locks.remove_if(key, |_, holder| holder.token == token);
        Ok(())
    }

    async fn holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, SchedulerError> {
        Ok(self
            .locks
            .get(key)
            .filter(|holder| holder.expires_at > now)
            .map(|holder| holder.token.clone()))
    }
}

/// Lock table in SQLite (`scheduler_locks`), shared by every process using
/// the same database file.
pub struct SqliteLockBackend {
    conn: Mutex<Connection>,
}

impl SqliteLockBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let conn = db::open(path).map_err(|e| SchedulerError::Store(e.to_string()))?;
        Self::new(conn)
    }

    pub fn new(conn: Connection) -> Result<Self, SchedulerError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduler_locks (
                lock_key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl LockBackend for SqliteLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, SchedulerError> {
        let expires_at = now + to_chrono(ttl)?;
        let conn = lock_conn(&self.conn)?;

        // The upsert only overwrites an expired row or our own
        let changed = conn.execute(
            "INSERT INTO scheduler_locks (lock_key, token, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(lock_key) DO UPDATE
             SET token = excluded.token, expires_at = excluded.expires_at
             WHERE scheduler_locks.expires_at <= ?4 OR scheduler_locks.token = excluded.token",
            params![key, token, format_timestamp(expires_at), format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    async fn refresh(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, SchedulerError> {
        let expires_at = now + to_chrono(ttl)?;
        let conn = lock_conn(&self.conn)?;

        let changed = conn.execute(
            "UPDATE scheduler_locks SET expires_at = ?1
             WHERE lock_key = ?2 AND token = ?3 AND expires_at > ?4",
            params![format_timestamp(expires_at), key, token, format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), SchedulerError> {
        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "DELETE FROM scheduler_locks WHERE lock_key = ?1 AND token = ?2",
            params![key, token],
        )?;
        Ok(())
    }

    async fn holder(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, SchedulerError> {
        let conn = lock_conn(&self.conn)?;
        let token = conn
            .query_row(
                "SELECT token FROM scheduler_locks WHERE lock_key = ?1 AND expires_at > ?2",
                params![key, format_timestamp(now)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }
}
