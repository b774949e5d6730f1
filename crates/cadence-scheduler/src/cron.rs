//! Cron expression evaluation.
//!
//! Accepts classic five-field expressions (minute first, day-of-week
//! 0-7 with 0 and 7 both Sunday), six/seven-field expressions with a
//! leading seconds field, and the common `@` macros. All evaluation is in
//! UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use ::cron::Schedule;

use crate::SchedulerError;

const DAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// A parsed, validated cron expression.
#[derive(Clone)]
pub struct CronExpression {
    source: String,
    schedule: Schedule,
}

impl CronExpression {
    /// Parse an expression.
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        let normalized = normalize(expression.trim()).map_err(invalid)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            source: expression.trim().to_string(),
            schedule,
        })
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `after`.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Whether at least one occurrence falls in `(after, now]`.
    pub fn has_missed(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_occurrence(after).is_some_and(|next| next <= now)
    }

    /// Most recent occurrence in `(after, now]`.
    ///
    /// Walks backwards from `now`, so the cost does not depend on how many
    /// occurrences were missed.
    pub fn latest_occurrence(
        &self,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        // Occurrences are whole seconds; step past `now` so an occurrence at
        // exactly `now` is included.
        let bound = now
            .duration_trunc(Duration::seconds(1))
            .unwrap_or(now)
            + Duration::seconds(1);

        self.schedule
            .after(&bound)
            .next_back()
            .filter(|latest| *latest <= now && *latest > after)
    }

    /// Occurrences in `(after, now]`, oldest first, computed lazily.
    pub fn missed_occurrences(
        &self,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.schedule
            .after(&after)
            .take_while(move |occurrence| *occurrence <= now)
    }
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpression {}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rewrite an expression into the seconds-first form the `cron` crate
/// expects.
fn normalize(expression: &str) -> Result<String, String> {
    if expression.is_empty() {
        return Err("empty expression".to_string());
    }

    if let Some(name) = expression.strip_prefix('@') {
        let expanded = match name.to_ascii_lowercase().as_str() {
            "yearly" | "annually" => "0 0 0 1 1 *",
            "monthly" => "0 0 0 1 * *",
            "weekly" => "0 0 0 * * Sun",
            "daily" | "midnight" => "0 0 0 * * *",
            "hourly" => "0 0 * * * *",
            _ => return Err(format!("unknown macro @{}", name)),
        };
        return Ok(expanded.to_string());
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = day_of_week_names(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], day_of_week
            ))
        }
        6 | 7 => {
            let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
            fields[5] = day_of_week_names(&fields[5])?;
            Ok(fields.join(" "))
        }
        n => Err(format!("expected 5, 6 or 7 fields, found {}", n)),
    }
}

/// Translate numeric day-of-week values (0-7, Sunday = 0 or 7) into names.
fn day_of_week_names(field: &str) -> Result<String, String> {
    let mut parts = Vec::new();

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };

        let numeric = range
            .split('-')
            .all(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()));
        if range == "*" || range == "?" || !numeric {
            parts.push(part.to_string());
            continue;
        }

        let parse = |v: &str| -> Result<usize, String> {
            let day: usize = v.parse().map_err(|_| format!("bad day of week {}", v))?;
            if day > 7 {
                return Err(format!("day of week {} out of range 0-7", day));
            }
            Ok(day)
        };

        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let day = parse(range)?;
                (day, if step.is_some() { 7 } else { day })
            }
        };
        if start > end {
            return Err(format!("day of week range {} is reversed", range));
        }

        let step = match step {
            Some(s) => s
                .parse::<usize>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| format!("bad step {}", s))?,
            None => 1,
        };

        for day in (start..=end).step_by(step) {
            let name = DAY_NAMES[day];
            if !parts.iter().any(|p| p == name) {
                parts.push(name.to_string());
            }
        }
    }

    Ok(parts.join(","))
}
