//! Lock-guarded recurring job scheduler for Cadence.
//!
//! This crate provides:
//! - Cron evaluation with lazy missed-run queries
//! - Validated schedule definitions loaded once from configuration
//! - A shared run-state store recording the last claimed run per schedule
//! - Expiring advisory locks so several scheduler processes can share a
//!   schedule set without dispatching an occurrence twice
//! - The `ScheduleEngine`, which turns due occurrences into `JobMessage`s

mod cron;
mod engine;
mod error;
pub mod lock;
pub mod run_state;
mod schedule;
mod store;

pub use self::cron::CronExpression;
pub use engine::{EngineConfig, ScheduleEngine, ScheduleOutcome, TickReport, UpcomingRun};
pub use error::SchedulerError;
pub use lock::{
    BackendLockFactory, KeyedLock, Lock, LockBackend, LockFactory, MemoryLockBackend,
    SqliteLockBackend,
};
pub use run_state::{MemoryRunStateStore, RunStateStore, SqliteRunStateStore};
pub use schedule::{Schedule, ScheduleDefinition, ScheduleSet};
