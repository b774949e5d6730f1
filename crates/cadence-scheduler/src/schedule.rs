//! Schedule definitions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use cadence_messenger::{DEFAULT_QUEUE, JobMessage, header, validate_queue_name};

use crate::{CronExpression, SchedulerError};

/// Purpose tag appended to the schedule key to form the claim lock key.
const CLAIM_LOCK_TAG: &str = "claim";

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_lock_ttl_secs() -> u64 {
    60
}

/// A schedule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Unique name of the logical job.
    pub key: String,
    /// Cron expression or `@` macro.
    pub cron: String,
    /// Message kind used to route the job to its handler.
    pub message_kind: String,
    /// Job payload template.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Collapse missed occurrences into a single dispatch of the latest.
    #[serde(default)]
    pub process_only_last_missed_run: bool,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl ScheduleDefinition {
    /// A definition with default queue, TTL and an empty payload.
    pub fn new(key: impl Into<String>, cron: impl Into<String>, message_kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cron: cron.into(),
            message_kind: message_kind.into(),
            payload: serde_json::Value::Null,
            queue: default_queue(),
            process_only_last_missed_run: false,
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

/// A validated, immutable schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub key: String,
    pub cron: CronExpression,
    pub message_kind: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub process_only_last_missed_run: bool,
    pub lock_ttl: Duration,
}

impl Schedule {
    /// Validate a definition.
    pub fn from_definition(definition: &ScheduleDefinition) -> Result<Self, SchedulerError> {
        if definition.key.trim().is_empty() {
            return Err(SchedulerError::InvalidConfig("schedule key is empty".to_string()));
        }
        if definition.message_kind.trim().is_empty() {
            return Err(SchedulerError::InvalidConfig(format!(
                "schedule {} has no message kind",
                definition.key
            )));
        }
        if definition.lock_ttl_secs == 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "schedule {} has a zero lock TTL",
                definition.key
            )));
        }
        validate_queue_name(&definition.queue)
            .map_err(|e| SchedulerError::InvalidConfig(format!("schedule {}: {}", definition.key, e)))?;

        Ok(Self {
            key: definition.key.clone(),
            cron: CronExpression::parse(&definition.cron)?,
            message_kind: definition.message_kind.clone(),
            payload: definition.payload.clone(),
            queue: definition.queue.clone(),
            process_only_last_missed_run: definition.process_only_last_missed_run,
            lock_ttl: Duration::from_secs(definition.lock_ttl_secs),
        })
    }

    /// Key of the lock that serializes claims for this schedule.
    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.key, CLAIM_LOCK_TAG)
    }

    /// Render the job message for one occurrence.
    pub fn build_message(&self, occurrence: DateTime<Utc>, now: DateTime<Utc>) -> JobMessage {
        let scheduled_at = occurrence.to_rfc3339_opts(SecondsFormat::Secs, true);
        let body = json!({
            "schedule_key": self.key,
            "scheduled_at": scheduled_at,
            "payload": self.payload,
        });

        JobMessage::new(&self.message_kind, body.to_string(), &self.queue)
            .with_created_at(now)
            .with_header(header::SCHEDULE_KEY, &self.key)
            .with_header(header::SCHEDULED_AT, scheduled_at)
    }
}

/// The immutable set of schedules a process evaluates.
#[derive(Debug, Clone, Default)]
pub struct ScheduleSet {
    schedules: Vec<Arc<Schedule>>,
}

impl ScheduleSet {
    /// Build a set from definitions.
    ///
    /// Invalid or duplicate definitions are skipped and returned alongside
    /// the set; they never prevent the other schedules from registering.
    pub fn from_definitions(definitions: &[ScheduleDefinition]) -> (Self, Vec<SchedulerError>) {
        let mut seen = HashSet::new();
        let mut schedules = Vec::new();
        let mut errors = Vec::new();

        for definition in definitions {
            if !seen.insert(definition.key.as_str()) {
                warn!(schedule_key = %definition.key, "duplicate schedule ignored");
                errors.push(SchedulerError::DuplicateSchedule(definition.key.clone()));
                continue;
            }

            match Schedule::from_definition(definition) {
                Ok(schedule) => schedules.push(Arc::new(schedule)),
                Err(e) => {
                    warn!(schedule_key = %definition.key, error = %e, "schedule rejected");
                    errors.push(e);
                }
            }
        }

        (Self { schedules }, errors)
    }

    /// A set of already validated schedules.
    pub fn new(schedules: Vec<Schedule>) -> Self {
        Self {
            schedules: schedules.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Schedule>> {
        self.schedules.iter().find(|s| s.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Schedule>> {
        self.schedules.iter()
    }

    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}
