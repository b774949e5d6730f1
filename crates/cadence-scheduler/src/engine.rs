//! The schedule engine.
//!
//! Every tick, each schedule is evaluated independently:
//!
//! 1. Compare the cron expression against the schedule's last claim (or the
//!    engine's start time) to decide whether an occurrence is due.
//! 2. Take the schedule's claim lock without blocking. A held lock means a
//!    sibling instance is claiming; the schedule is skipped.
//! 3. Re-read the run state under the lock, dispatch the missed occurrences
//!    (only the latest when coalescing), then advance the run state.
//! 4. Release the lock, whatever happened.
//!
//! A failing schedule produces a `ScheduleFailure` event and never affects
//! the other schedules of the tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use cadence_messenger::{Event, EventDispatcher, JobMessage, SkipReason, Transport};

use crate::lock::{Lock, LockFactory};
use crate::run_state::RunStateStore;
use crate::schedule::{Schedule, ScheduleSet};
use crate::SchedulerError;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Upper bound on a single transport send.
    pub dispatch_timeout: Duration,
    /// Schedules evaluated concurrently within one tick.
    pub max_concurrent_schedules: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            dispatch_timeout: Duration::from_secs(10),
            max_concurrent_schedules: 8,
        }
    }
}

/// What happened to one schedule on one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    Skipped(SkipReason),
    /// Occurrences dispatched, oldest first.
    Dispatched { occurrences: Vec<DateTime<Utc>> },
    Failed { error: String },
}

/// Per-schedule outcomes of a tick, in schedule order.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub outcomes: Vec<(String, ScheduleOutcome)>,
}

impl TickReport {
    /// Outcome for a schedule key.
    pub fn outcome(&self, key: &str) -> Option<&ScheduleOutcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, outcome)| outcome)
    }

    /// Total messages dispatched during the tick.
    pub fn dispatched(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                ScheduleOutcome::Dispatched { occurrences } => occurrences.len(),
                _ => 0,
            })
            .sum()
    }

    /// Number of schedules that failed.
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ScheduleOutcome::Failed { .. }))
            .count()
    }
}

/// Operator view of one schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct UpcomingRun {
    pub schedule_key: String,
    pub cron: String,
    pub message_kind: String,
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub next_occurrence: Option<DateTime<Utc>>,
}

/// A claim or dispatch error, with the message being sent when it happened.
struct ClaimFailure {
    error: SchedulerError,
    message: Option<JobMessage>,
}

impl From<SchedulerError> for ClaimFailure {
    fn from(error: SchedulerError) -> Self {
        Self {
            error,
            message: None,
        }
    }
}

/// Evaluates a fixed set of schedules against shared run state and locks.
pub struct ScheduleEngine {
    schedules: ScheduleSet,
    run_state: Arc<dyn RunStateStore>,
    locks: Arc<dyn LockFactory>,
    transport: Arc<dyn Transport>,
    events: Arc<EventDispatcher>,
    config: EngineConfig,
    started_at: DateTime<Utc>,
}

impl ScheduleEngine {
    /// Create an engine. Schedules without a recorded claim count missed
    /// occurrences from `started_at`.
    pub fn new(
        schedules: ScheduleSet,
        run_state: Arc<dyn RunStateStore>,
        locks: Arc<dyn LockFactory>,
        transport: Arc<dyn Transport>,
        events: Arc<EventDispatcher>,
        config: EngineConfig,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schedules,
            run_state,
            locks,
            transport,
            events,
            config,
            started_at,
        }
    }

    pub fn schedules(&self) -> &ScheduleSet {
        &self.schedules
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate every schedule once at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut outcomes: Vec<(usize, String, ScheduleOutcome)> =
            stream::iter(self.schedules.iter().cloned().enumerate())
                .map(|(index, schedule)| async move {
                    let outcome = self.evaluate(&schedule, now).await;
                    (index, schedule.key.clone(), outcome)
                })
                .buffer_unordered(self.config.max_concurrent_schedules.max(1))
                .collect()
                .await;

        outcomes.sort_by_key(|(index, _, _)| *index);

        TickReport {
            outcomes: outcomes
                .into_iter()
                .map(|(_, key, outcome)| (key, outcome))
                .collect(),
        }
    }

    /// Evaluate one schedule. Never fails: errors become a
    /// `ScheduleFailure` event and a `Failed` outcome.
    #[tracing::instrument(skip(self, schedule), fields(schedule_key = %schedule.key))]
    async fn evaluate(&self, schedule: &Schedule, now: DateTime<Utc>) -> ScheduleOutcome {
        let outcome = match self.try_evaluate(schedule, now).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                let error = failure.error.to_string();
                self.events.dispatch(&Event::ScheduleFailure {
                    schedule_key: schedule.key.clone(),
                    message: failure.message,
                    error: error.clone(),
                });
                ScheduleOutcome::Failed { error }
            }
        };

        if let ScheduleOutcome::Skipped(reason) = &outcome {
            self.events.dispatch(&Event::ScheduleSkipped {
                schedule_key: schedule.key.clone(),
                reason: reason.clone(),
            });
        }

        outcome
    }

    async fn try_evaluate(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, ClaimFailure> {
        let after = self
            .run_state
            .get(&schedule.key)
            .await?
            .unwrap_or(self.started_at);

        if !schedule.cron.has_missed(after, now) {
            return Ok(ScheduleOutcome::Skipped(SkipReason::NotDue {
                next: schedule.cron.next_occurrence(after),
            }));
        }

        let mut lock = self.locks.make(&schedule.lock_key(), schedule.lock_ttl);
        if !lock.acquire(false, Duration::ZERO).await? {
            debug!("claim lock held elsewhere");
            return Ok(ScheduleOutcome::Skipped(SkipReason::LockUnavailable));
        }

        let result = self.claim(schedule, lock.as_mut(), now).await;

        if let Err(e) = lock.release().await {
            warn!(error = %e, "failed to release claim lock");
        }

        result
    }

    /// Dispatch under the claim lock and advance the run state.
    async fn claim(
        &self,
        schedule: &Schedule,
        lock: &mut dyn Lock,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, ClaimFailure> {
        // A sibling may have claimed between the due check and the lock
        let after = self
            .run_state
            .get(&schedule.key)
            .await?
            .unwrap_or(self.started_at);
        if !schedule.cron.has_missed(after, now) {
            return Ok(ScheduleOutcome::Skipped(SkipReason::AlreadyClaimed));
        }

        let occurrences: Box<dyn Iterator<Item = DateTime<Utc>> + Send + '_> =
            if schedule.process_only_last_missed_run {
                Box::new(schedule.cron.latest_occurrence(after, now).into_iter())
            } else {
                Box::new(schedule.cron.missed_occurrences(after, now))
            };

        let refresh_after = lock.ttl() / 2;
        let mut refreshed_at = Instant::now();
        let mut dispatched = Vec::new();

        for occurrence in occurrences {
            if refreshed_at.elapsed() > refresh_after {
                let still_held = lock.refresh(None).await.unwrap_or_else(|e| {
                    warn!(error = %e, "claim lock refresh failed");
                    false
                });
                if !still_held {
                    self.record_partial(schedule, &dispatched).await;
                    return Err(SchedulerError::LockLost(lock.key().to_string()).into());
                }
                refreshed_at = Instant::now();
            }

            let message = schedule.build_message(occurrence, now);
            if let Err(error) = self.dispatch(schedule, occurrence, &message).await {
                self.record_partial(schedule, &dispatched).await;
                return Err(ClaimFailure {
                    error,
                    message: Some(message),
                });
            }
            dispatched.push(occurrence);
        }

        if let Err(e) = self.run_state.set(&schedule.key, now).await {
            error!(
                error = %e,
                occurrences = ?dispatched,
                "claim not recorded, the next tick dispatches these occurrences again"
            );
            return Err(e.into());
        }

        info!(
            occurrences = dispatched.len(),
            coalesced = schedule.process_only_last_missed_run,
            "schedule claimed"
        );
        Ok(ScheduleOutcome::Dispatched {
            occurrences: dispatched,
        })
    }

    /// Send one message, bounded by the dispatch timeout.
    async fn dispatch(
        &self,
        schedule: &Schedule,
        occurrence: DateTime<Utc>,
        message: &JobMessage,
    ) -> Result<(), SchedulerError> {
        self.events.dispatch(&Event::PreRun {
            schedule_key: schedule.key.clone(),
            occurrence,
            message: message.clone(),
        });

        match timeout(self.config.dispatch_timeout, self.transport.send(message.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SchedulerError::Dispatch(e)),
            Err(_) => return Err(SchedulerError::DispatchTimeout(self.config.dispatch_timeout)),
        }

        self.events.dispatch(&Event::PostRun {
            schedule_key: schedule.key.clone(),
            occurrence,
            message: message.clone(),
        });
        Ok(())
    }

    /// Keep the occurrences that did go out from being dispatched again.
    async fn record_partial(&self, schedule: &Schedule, dispatched: &[DateTime<Utc>]) {
        let Some(last) = dispatched.last() else {
            return;
        };
        if let Err(e) = self.run_state.set(&schedule.key, *last).await {
            warn!(error = %e, "failed to record partial claim");
        }
    }

    /// Next occurrence after `now` for every schedule.
    pub async fn upcoming(&self, now: DateTime<Utc>) -> Result<Vec<UpcomingRun>, SchedulerError> {
        let mut runs = Vec::with_capacity(self.schedules.len());
        for schedule in self.schedules.iter() {
            runs.push(UpcomingRun {
                schedule_key: schedule.key.clone(),
                cron: schedule.cron.to_string(),
                message_kind: schedule.message_kind.clone(),
                last_claimed_at: self.run_state.get(&schedule.key).await?,
                next_occurrence: schedule.cron.next_occurrence(now),
            });
        }
        Ok(runs)
    }

    /// Tick at the configured interval until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            schedules = self.schedules.len(),
            tick_interval = ?self.config.tick_interval,
            "schedule engine starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let report = self.tick_at(Utc::now()).await;
            if report.dispatched() > 0 || report.failed() > 0 {
                debug!(
                    dispatched = report.dispatched(),
                    failed = report.failed(),
                    "tick complete"
                );
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("schedule engine received shutdown signal");
                    }
                }
                _ = sleep(self.config.tick_interval) => {}
            }
        }

        info!("schedule engine shut down gracefully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cadence_messenger::{EventKind, InMemoryTransport, MessengerError, header};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use crate::lock::testing::{SpyCalls, SpyLockFactory};
    use crate::lock::{BackendLockFactory, MemoryLockBackend};
    use crate::run_state::MemoryRunStateStore;
    use crate::schedule::ScheduleDefinition;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn schedule(key: &str, cron: &str, coalesce: bool) -> Schedule {
        let mut definition = ScheduleDefinition::new(key, cron, "report");
        definition.process_only_last_missed_run = coalesce;
        Schedule::from_definition(&definition).unwrap()
    }

    fn recorder() -> (Arc<EventDispatcher>, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let seen = Arc::clone(&seen);
            Arc::new(move |event: &Event| seen.lock().unwrap().push(event.clone()))
        };
        let events = EventDispatcher::builder().listen_all(listener).build();
        (Arc::new(events), seen)
    }

    fn kinds(seen: &Mutex<Vec<Event>>) -> Vec<EventKind> {
        seen.lock().unwrap().iter().map(Event::kind).collect()
    }

    struct Fixture {
        engine: ScheduleEngine,
        transport: Arc<InMemoryTransport>,
        run_state: Arc<MemoryRunStateStore>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    fn fixture(schedules: Vec<Schedule>, started_at: DateTime<Utc>) -> Fixture {
        let transport = Arc::new(InMemoryTransport::new());
        let run_state = Arc::new(MemoryRunStateStore::new());
        let (dispatcher, events) = recorder();
        let engine = ScheduleEngine::new(
            ScheduleSet::new(schedules),
            run_state.clone(),
            Arc::new(BackendLockFactory::new(Arc::new(MemoryLockBackend::new()))),
            transport.clone(),
            dispatcher,
            EngineConfig::default(),
            started_at,
        );
        Fixture {
            engine,
            transport,
            run_state,
            events,
        }
    }

    #[tokio::test]
    async fn test_daily_report_coalesces_missed_runs() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let f = fixture(vec![schedule("daily-report", "@daily", true)], now);
        f.run_state
            .set("daily-report", now - chrono::Duration::days(2))
            .await
            .unwrap();

        let report = f.engine.tick_at(now).await;

        assert_eq!(
            report.outcome("daily-report"),
            Some(&ScheduleOutcome::Dispatched {
                occurrences: vec![at(2025, 3, 10, 0, 0, 0)]
            })
        );

        let sent = f.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0.header(header::SCHEDULED_AT),
            Some("2025-03-10T00:00:00Z")
        );
        assert_eq!(f.run_state.get("daily-report").await.unwrap(), Some(now));
        assert_eq!(
            kinds(&f.events),
            vec![EventKind::PreRun, EventKind::PostRun]
        );
    }

    #[tokio::test]
    async fn test_missed_runs_expand_in_order() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let f = fixture(vec![schedule("hourly", "@hourly", false)], now);
        f.run_state
            .set("hourly", at(2025, 3, 10, 5, 30, 0))
            .await
            .unwrap();

        let report = f.engine.tick_at(now).await;

        let expected: Vec<_> = (6..=9).map(|h| at(2025, 3, 10, h, 0, 0)).collect();
        assert_eq!(
            report.outcome("hourly"),
            Some(&ScheduleOutcome::Dispatched {
                occurrences: expected.clone()
            })
        );

        let sent: Vec<String> = f
            .transport
            .sent()
            .await
            .into_iter()
            .filter_map(|(m, _)| m.header(header::SCHEDULED_AT).map(str::to_string))
            .collect();
        assert_eq!(
            sent,
            vec![
                "2025-03-10T06:00:00Z",
                "2025-03-10T07:00:00Z",
                "2025-03-10T08:00:00Z",
                "2025-03-10T09:00:00Z",
            ]
        );
    }

    #[tokio::test]
    async fn test_not_due_is_skipped_from_start_time() {
        let started = at(2025, 3, 10, 9, 30, 0);
        let f = fixture(vec![schedule("daily-report", "@daily", true)], started);

        let report = f.engine.tick_at(started + chrono::Duration::hours(1)).await;

        assert_eq!(
            report.outcome("daily-report"),
            Some(&ScheduleOutcome::Skipped(SkipReason::NotDue {
                next: Some(at(2025, 3, 11, 0, 0, 0))
            }))
        );
        assert!(f.transport.sent().await.is_empty());
        assert_eq!(kinds(&f.events), vec![EventKind::ScheduleSkipped]);
    }

    #[tokio::test]
    async fn test_second_tick_does_not_redispatch() {
        let started = at(2025, 3, 10, 9, 30, 0);
        let f = fixture(vec![schedule("hourly", "@hourly", false)], started);

        let first = f.engine.tick_at(at(2025, 3, 10, 10, 0, 5)).await;
        assert_eq!(first.dispatched(), 1);

        let second = f.engine.tick_at(at(2025, 3, 10, 10, 0, 6)).await;
        assert_eq!(second.dispatched(), 0);
        assert_eq!(f.transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_unavailable_is_skipped() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let calls = Arc::new(SpyCalls::default());
        let transport = Arc::new(InMemoryTransport::new());
        let (dispatcher, events) = recorder();

        let engine = ScheduleEngine::new(
            ScheduleSet::new(vec![schedule("daily-report", "@daily", true)]),
            Arc::new(MemoryRunStateStore::new()),
            Arc::new(SpyLockFactory {
                calls: calls.clone(),
            }),
            transport.clone(),
            dispatcher,
            EngineConfig::default(),
            now - chrono::Duration::days(1),
        );

        let report = engine.tick_at(now).await;

        assert_eq!(
            report.outcome("daily-report"),
            Some(&ScheduleOutcome::Skipped(SkipReason::LockUnavailable))
        );
        assert_eq!(SpyCalls::count(&calls.acquire), 1);
        assert_eq!(SpyCalls::count(&calls.release), 0);
        assert!(transport.sent().await.is_empty());
        assert_eq!(kinds(&events), vec![EventKind::ScheduleSkipped]);
    }

    /// Run state that reports "never claimed" on the first read, then
    /// pretends a sibling claimed just before the lock was taken.
    #[derive(Default)]
    struct RacingRunState {
        reads: AtomicUsize,
        inner: MemoryRunStateStore,
        sibling_claim: Mutex<Option<DateTime<Utc>>>,
    }

    #[async_trait]
    impl RunStateStore for RacingRunState {
        async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(None);
            }
            let claim = *self.sibling_claim.lock().unwrap();
            if let Some(claim) = claim {
                self.inner.set(key, claim).await?;
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
            self.inner.set(key, at).await
        }

        async fn reset(&self, key: &str) -> Result<(), SchedulerError> {
            self.inner.reset(key).await
        }
    }

    #[tokio::test]
    async fn test_already_claimed_releases_lock() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let calls = SpyCalls::granting();
        let run_state = Arc::new(RacingRunState::default());
        *run_state.sibling_claim.lock().unwrap() = Some(now);
        let transport = Arc::new(InMemoryTransport::new());
        let (dispatcher, _) = recorder();

        let engine = ScheduleEngine::new(
            ScheduleSet::new(vec![schedule("daily-report", "@daily", true)]),
            run_state,
            Arc::new(SpyLockFactory {
                calls: calls.clone(),
            }),
            transport.clone(),
            dispatcher,
            EngineConfig::default(),
            now - chrono::Duration::days(1),
        );

        let report = engine.tick_at(now).await;

        assert_eq!(
            report.outcome("daily-report"),
            Some(&ScheduleOutcome::Skipped(SkipReason::AlreadyClaimed))
        );
        assert_eq!(SpyCalls::count(&calls.release), 1);
        assert!(transport.sent().await.is_empty());
    }

    /// Transport that refuses messages of one kind.
    struct RejectingTransport {
        inner: InMemoryTransport,
        reject_kind: &'static str,
        sends: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl RejectingTransport {
        fn new(reject_kind: &'static str) -> Self {
            Self {
                inner: InMemoryTransport::new(),
                reject_kind,
                sends: AtomicUsize::new(0),
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl Transport for RejectingTransport {
        async fn send_at(
            &self,
            message: JobMessage,
            available_at: DateTime<Utc>,
        ) -> Result<(), MessengerError> {
            let sent = self.sends.fetch_add(1, Ordering::SeqCst);
            if message.kind() == Some(self.reject_kind) || self.fail_after.is_some_and(|n| sent >= n) {
                return Err(MessengerError::Transport("queue unreachable".to_string()));
            }
            self.inner.send_at(message, available_at).await
        }
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_isolated_and_releases_lock() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let calls = SpyCalls::granting();
        let transport = Arc::new(RejectingTransport::new("broken"));
        let run_state = Arc::new(MemoryRunStateStore::new());
        let (dispatcher, events) = recorder();

        let broken = {
            let definition = ScheduleDefinition::new("broken", "@daily", "broken");
            Schedule::from_definition(&definition).unwrap()
        };

        let engine = ScheduleEngine::new(
            ScheduleSet::new(vec![broken, schedule("daily-report", "@daily", true)]),
            run_state.clone(),
            Arc::new(SpyLockFactory {
                calls: calls.clone(),
            }),
            transport.clone(),
            dispatcher,
            EngineConfig::default(),
            now - chrono::Duration::days(1),
        );

        let report = engine.tick_at(now).await;

        assert!(matches!(
            report.outcome("broken"),
            Some(ScheduleOutcome::Failed { .. })
        ));
        assert_eq!(report.dispatched(), 1);
        assert_eq!(SpyCalls::count(&calls.release), 2);

        // The failed schedule stays due for the next tick
        assert_eq!(run_state.get("broken").await.unwrap(), None);
        assert_eq!(run_state.get("daily-report").await.unwrap(), Some(now));

        let failure = events
            .lock()
            .unwrap()
            .iter()
            .find_map(|event| match event {
                Event::ScheduleFailure {
                    schedule_key,
                    message,
                    error,
                } => Some((schedule_key.clone(), message.clone(), error.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(failure.0, "broken");
        assert_eq!(failure.1.unwrap().kind(), Some("broken"));
        assert!(failure.2.contains("queue unreachable"));
    }

    #[tokio::test]
    async fn test_partial_expansion_records_last_dispatched() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let mut transport = RejectingTransport::new("never");
        transport.fail_after = Some(2);
        let transport = Arc::new(transport);
        let run_state = Arc::new(MemoryRunStateStore::new());
        let (dispatcher, _) = recorder();

        let engine = ScheduleEngine::new(
            ScheduleSet::new(vec![schedule("hourly", "@hourly", false)]),
            run_state.clone(),
            Arc::new(BackendLockFactory::new(Arc::new(MemoryLockBackend::new()))),
            transport,
            dispatcher,
            EngineConfig::default(),
            at(2025, 3, 10, 5, 30, 0),
        );

        let report = engine.tick_at(now).await;

        assert!(matches!(report.outcome("hourly"), Some(ScheduleOutcome::Failed { .. })));
        assert_eq!(
            run_state.get("hourly").await.unwrap(),
            Some(at(2025, 3, 10, 7, 0, 0))
        );
    }

    /// Transport that never answers.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send_at(
            &self,
            _message: JobMessage,
            _available_at: DateTime<Utc>,
        ) -> Result<(), MessengerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let calls = SpyCalls::granting();
        let (dispatcher, events) = recorder();

        let engine = ScheduleEngine::new(
            ScheduleSet::new(vec![schedule("daily-report", "@daily", true)]),
            Arc::new(MemoryRunStateStore::new()),
            Arc::new(SpyLockFactory {
                calls: calls.clone(),
            }),
            Arc::new(StalledTransport),
            dispatcher,
            EngineConfig {
                dispatch_timeout: Duration::from_millis(200),
                ..EngineConfig::default()
            },
            now - chrono::Duration::days(1),
        );

        let report = engine.tick_at(now).await;

        assert_eq!(
            report.outcome("daily-report"),
            Some(&ScheduleOutcome::Failed {
                error: SchedulerError::DispatchTimeout(Duration::from_millis(200)).to_string()
            })
        );
        assert_eq!(SpyCalls::count(&calls.release), 1);
        assert_eq!(
            kinds(&events),
            vec![EventKind::PreRun, EventKind::ScheduleFailure]
        );
    }

    /// Transport that takes `delay` to accept each message.
    struct SlowTransport {
        inner: InMemoryTransport,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send_at(
            &self,
            message: JobMessage,
            available_at: DateTime<Utc>,
        ) -> Result<(), MessengerError> {
            sleep(self.delay).await;
            self.inner.send_at(message, available_at).await
        }
    }

    /// Engine expanding four missed hourly runs over a transport that needs
    /// 40s per send, with the default 60s lock TTL.
    fn slow_expansion(
        calls: Arc<SpyCalls>,
    ) -> (ScheduleEngine, Arc<SlowTransport>, Arc<MemoryRunStateStore>) {
        let transport = Arc::new(SlowTransport {
            inner: InMemoryTransport::new(),
            delay: Duration::from_secs(40),
        });
        let run_state = Arc::new(MemoryRunStateStore::new());
        let (dispatcher, _) = recorder();

        let engine = ScheduleEngine::new(
            ScheduleSet::new(vec![schedule("hourly", "@hourly", false)]),
            run_state.clone(),
            Arc::new(SpyLockFactory { calls }),
            transport.clone(),
            dispatcher,
            EngineConfig {
                dispatch_timeout: Duration::from_secs(60),
                ..EngineConfig::default()
            },
            at(2025, 3, 10, 5, 30, 0),
        );
        (engine, transport, run_state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_expansion_refreshes_lock() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let calls = SpyCalls::granting();
        let (engine, transport, run_state) = slow_expansion(calls.clone());

        let report = engine.tick_at(now).await;

        assert_eq!(report.dispatched(), 4);
        // Every send after the first starts past half the TTL
        assert_eq!(SpyCalls::count(&calls.refresh), 3);
        assert_eq!(SpyCalls::count(&calls.release), 1);
        assert_eq!(transport.inner.sent().await.len(), 4);
        assert_eq!(run_state.get("hourly").await.unwrap(), Some(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lock_stops_expansion() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let calls = SpyCalls::granting();
        calls.lose_on_refresh.store(true, Ordering::SeqCst);
        let (engine, transport, run_state) = slow_expansion(calls.clone());

        let report = engine.tick_at(now).await;

        assert_eq!(
            report.outcome("hourly"),
            Some(&ScheduleOutcome::Failed {
                error: SchedulerError::LockLost("hourly:claim".to_string()).to_string()
            })
        );
        assert_eq!(SpyCalls::count(&calls.refresh), 1);
        assert_eq!(SpyCalls::count(&calls.release), 1);

        // Nothing after the first occurrence goes out, and the claim is not
        // advanced to `now`
        let sent = transport.inner.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0.header(header::SCHEDULED_AT),
            Some("2025-03-10T06:00:00Z")
        );
        assert_eq!(
            run_state.get("hourly").await.unwrap(),
            Some(at(2025, 3, 10, 6, 0, 0))
        );
    }

    /// Run state whose writes always fail.
    #[derive(Default)]
    struct ReadOnlyRunState {
        inner: MemoryRunStateStore,
    }

    #[async_trait]
    impl RunStateStore for ReadOnlyRunState {
        async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
            self.inner.get(key).await
        }

        async fn set(&self, _key: &str, _at: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
            Err(SchedulerError::Store("disk full".to_string()))
        }

        async fn reset(&self, key: &str) -> Result<(), SchedulerError> {
            self.inner.reset(key).await
        }
    }

    #[tokio::test]
    async fn test_unrecorded_claim_is_reported_as_failure() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let transport = Arc::new(InMemoryTransport::new());
        let (dispatcher, events) = recorder();

        let engine = ScheduleEngine::new(
            ScheduleSet::new(vec![schedule("daily-report", "@daily", true)]),
            Arc::new(ReadOnlyRunState::default()),
            Arc::new(BackendLockFactory::new(Arc::new(MemoryLockBackend::new()))),
            transport.clone(),
            dispatcher,
            EngineConfig::default(),
            now - chrono::Duration::days(1),
        );

        let report = engine.tick_at(now).await;

        assert_eq!(
            report.outcome("daily-report"),
            Some(&ScheduleOutcome::Failed {
                error: SchedulerError::Store("disk full".to_string()).to_string()
            })
        );
        assert_eq!(transport.sent().await.len(), 1);
        assert_eq!(
            kinds(&events),
            vec![EventKind::PreRun, EventKind::PostRun, EventKind::ScheduleFailure]
        );
    }

    #[tokio::test]
    async fn test_upcoming() {
        let now = at(2025, 3, 10, 9, 30, 0);
        let f = fixture(
            vec![
                schedule("daily-report", "@daily", true),
                schedule("hourly", "@hourly", false),
            ],
            now,
        );
        f.run_state.set("hourly", at(2025, 3, 10, 9, 0, 0)).await.unwrap();

        let upcoming = f.engine.upcoming(now).await.unwrap();

        assert_eq!(upcoming.len(), 2);
        assert_eq!(upcoming[0].next_occurrence, Some(at(2025, 3, 11, 0, 0, 0)));
        assert_eq!(upcoming[0].last_claimed_at, None);
        assert_eq!(upcoming[1].next_occurrence, Some(at(2025, 3, 10, 10, 0, 0)));
        assert_eq!(upcoming[1].last_claimed_at, Some(at(2025, 3, 10, 9, 0, 0)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(vec![schedule("daily-report", "@daily", true)], Utc::now());
        let (tx, rx) = watch::channel(false);

        let run = f.engine.run(rx);
        let stop = async {
            sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };

        let ((), ()) = tokio::join!(run, stop);
    }
}
