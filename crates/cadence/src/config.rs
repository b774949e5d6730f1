//! TOML configuration file.
//!
//! Read once at startup; every component receives the immutable pieces it
//! needs.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;
use tracing::{Level, warn};

use cadence_messenger::{
    DEFAULT_QUEUE, EventDispatcher, HandlerRegistry, LogMessageHandler, MultiplierRetryStrategy,
    TracingListener, WorkerConfig,
};
use cadence_scheduler::{EngineConfig, ScheduleDefinition, ScheduleSet};

/// Where claim locks live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    /// Shared through the database file; required for several processes.
    #[default]
    Sqlite,
    /// Process-local; only for a single scheduler process.
    Memory,
}

/// How scheduled messages reach their handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Enqueue to the SQLite queue; workers consume it.
    #[default]
    Async,
    /// Run the handler inline inside the scheduler.
    Sync,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_secs: u64,
    pub dispatch_timeout_secs: u64,
    pub max_concurrent_schedules: usize,
    pub lock_backend: LockBackendKind,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            dispatch_timeout_secs: 10,
            max_concurrent_schedules: 8,
            lock_backend: LockBackendKind::Sqlite,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub mode: TransportMode,
    /// Queue consumed when `[worker]` names none.
    pub queue: String,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            mode: TransportMode::Async,
            queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitSection {
    pub limit: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub queues: Vec<String>,
    pub idle_sleep_ms: u64,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub multiplier: f64,
    /// Zero leaves the delay uncapped.
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub rate_limit: Option<RateLimitSection>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            idle_sleep_ms: 1000,
            max_attempts: 3,
            delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 0,
            jitter: 0.1,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub dispatch_log_level: String,
    pub failure_log_level: String,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            dispatch_log_level: "debug".to_string(),
            failure_log_level: "warn".to_string(),
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerSection,
    pub schedules: Vec<ScheduleDefinition>,
    pub transport: TransportSection,
    pub worker: WorkerSection,
    pub events: EventsSection,
}

impl Config {
    /// Load a configuration file. A missing file yields the defaults and no
    /// schedules.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        contents
            .parse::<Config>()
            .wrap_err_with(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tick_interval: Duration::from_secs(self.scheduler.tick_interval_secs.max(1)),
            dispatch_timeout: Duration::from_secs(self.scheduler.dispatch_timeout_secs),
            max_concurrent_schedules: self.scheduler.max_concurrent_schedules.max(1),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let queues = if self.worker.queues.is_empty() {
            vec![self.transport.queue.clone()]
        } else {
            self.worker.queues.clone()
        };

        WorkerConfig {
            queues,
            idle_sleep: Duration::from_millis(self.worker.idle_sleep_ms),
            rate_limit: self
                .worker
                .rate_limit
                .map(|r| (r.limit, Duration::from_secs(r.interval_secs))),
        }
    }

    pub fn retry_strategy(&self) -> MultiplierRetryStrategy {
        MultiplierRetryStrategy::new(
            self.worker.max_attempts,
            Duration::from_millis(self.worker.delay_ms),
            self.worker.multiplier,
        )
        .with_max_delay(Duration::from_millis(self.worker.max_delay_ms))
        .with_jitter(self.worker.jitter)
    }

    /// Validated schedules. Invalid entries are logged and left out.
    pub fn schedule_set(&self) -> ScheduleSet {
        let (set, errors) = ScheduleSet::from_definitions(&self.schedules);
        for error in errors {
            warn!(error = %error, "schedule not registered");
        }
        set
    }

    /// Handlers for every configured message kind.
    ///
    /// Each kind logs its messages through `tracing`.
    pub fn handlers(&self) -> HandlerRegistry {
        self.schedules
            .iter()
            .fold(HandlerRegistry::new(), |registry, schedule| {
                registry.with(schedule.message_kind.clone(), Arc::new(LogMessageHandler))
            })
    }

    /// Event dispatcher logging every event.
    pub fn event_dispatcher(&self) -> Result<EventDispatcher> {
        Ok(EventDispatcher::builder()
            .listen_all(Arc::new(TracingListener))
            .dispatch_level(parse_level(&self.events.dispatch_log_level)?)
            .failure_level(parse_level(&self.events.failure_log_level)?)
            .build())
    }
}

impl FromStr for Config {
    type Err = miette::Report;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).into_diagnostic()
    }
}

fn parse_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| miette::miette!("unknown log level {:?}", level))
}
