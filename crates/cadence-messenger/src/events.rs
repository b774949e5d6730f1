//! Lifecycle events and their dispatch table.
//!
//! Every scheduler and worker transition produces one immutable [`Event`].
//! Listeners are registered per [`EventKind`] once at startup; the resulting
//! [`EventDispatcher`] is shared by reference with every emitting component.
//! A panicking listener is logged and skipped, it never changes the outcome
//! of the transition that produced the event.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Level, debug, error, info, trace, warn};

use crate::JobMessage;

/// Why the schedule engine skipped a schedule on a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No occurrence is due yet.
    NotDue { next: Option<DateTime<Utc>> },
    /// Another scheduler instance holds the claim lock.
    LockUnavailable,
    /// A sibling instance claimed the occurrence between the due check and
    /// lock acquisition.
    AlreadyClaimed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotDue { next: Some(next) } => write!(f, "not due until {}", next),
            SkipReason::NotDue { next: None } => write!(f, "no future occurrence"),
            SkipReason::LockUnavailable => write!(f, "lock held by another instance"),
            SkipReason::AlreadyClaimed => write!(f, "occurrence already claimed"),
        }
    }
}

/// A lifecycle event.
#[derive(Debug, Clone)]
pub enum Event {
    /// A scheduled message is about to be dispatched.
    PreRun {
        schedule_key: String,
        occurrence: DateTime<Utc>,
        message: JobMessage,
    },
    /// A scheduled message was accepted by the transport.
    PostRun {
        schedule_key: String,
        occurrence: DateTime<Utc>,
        message: JobMessage,
    },
    /// Claiming or dispatching a schedule failed.
    ScheduleFailure {
        schedule_key: String,
        message: Option<JobMessage>,
        error: String,
    },
    /// A schedule was not dispatched on this tick.
    ScheduleSkipped {
        schedule_key: String,
        reason: SkipReason,
    },
    /// A consumer received a message.
    MessageReceived {
        queue_name: String,
        message_id: u64,
        message: JobMessage,
    },
    /// A consumer handled a message successfully.
    MessageHandled {
        queue_name: String,
        message_id: u64,
        message: JobMessage,
    },
    /// A consumer acknowledged a message without handling it.
    MessageSkipped {
        queue_name: String,
        message_id: u64,
        message: JobMessage,
        reason: String,
    },
    /// Handling a message failed.
    MessageFailed {
        queue_name: String,
        message_id: u64,
        message: JobMessage,
        error: String,
        will_retry: bool,
    },
    /// A failed message was re-enqueued for another attempt.
    MessageRetried {
        queue_name: String,
        message_id: u64,
        message: JobMessage,
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    /// The consumer was throttled; nothing was attempted.
    ConsumerRateLimited {
        queues: Vec<String>,
        retry_after: Duration,
        message: Option<JobMessage>,
    },
}

/// Discriminant of [`Event`], used as the dispatch table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PreRun,
    PostRun,
    ScheduleFailure,
    ScheduleSkipped,
    MessageReceived,
    MessageHandled,
    MessageSkipped,
    MessageFailed,
    MessageRetried,
    ConsumerRateLimited,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 10] = [
        EventKind::PreRun,
        EventKind::PostRun,
        EventKind::ScheduleFailure,
        EventKind::ScheduleSkipped,
        EventKind::MessageReceived,
        EventKind::MessageHandled,
        EventKind::MessageSkipped,
        EventKind::MessageFailed,
        EventKind::MessageRetried,
        EventKind::ConsumerRateLimited,
    ];

    /// Stable name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PreRun => "pre_run",
            EventKind::PostRun => "post_run",
            EventKind::ScheduleFailure => "schedule_failure",
            EventKind::ScheduleSkipped => "schedule_skipped",
            EventKind::MessageReceived => "message_received",
            EventKind::MessageHandled => "message_handled",
            EventKind::MessageSkipped => "message_skipped",
            EventKind::MessageFailed => "message_failed",
            EventKind::MessageRetried => "message_retried",
            EventKind::ConsumerRateLimited => "consumer_rate_limited",
        }
    }
}

impl Event {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PreRun { .. } => EventKind::PreRun,
            Event::PostRun { .. } => EventKind::PostRun,
            Event::ScheduleFailure { .. } => EventKind::ScheduleFailure,
            Event::ScheduleSkipped { .. } => EventKind::ScheduleSkipped,
            Event::MessageReceived { .. } => EventKind::MessageReceived,
            Event::MessageHandled { .. } => EventKind::MessageHandled,
            Event::MessageSkipped { .. } => EventKind::MessageSkipped,
            Event::MessageFailed { .. } => EventKind::MessageFailed,
            Event::MessageRetried { .. } => EventKind::MessageRetried,
            Event::ConsumerRateLimited { .. } => EventKind::ConsumerRateLimited,
        }
    }
}

/// Observer of events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Builder for an [`EventDispatcher`].
pub struct EventDispatcherBuilder {
    listeners: HashMap<EventKind, Vec<Arc<dyn EventListener>>>,
    dispatch_level: Level,
    failure_level: Level,
}

impl Default for EventDispatcherBuilder {
    fn default() -> Self {
        Self {
            listeners: HashMap::new(),
            dispatch_level: Level::DEBUG,
            failure_level: Level::WARN,
        }
    }
}

impl EventDispatcherBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener for one event kind.
    pub fn listen(mut self, kind: EventKind, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.entry(kind).or_default().push(listener);
        self
    }

    /// Append a listener for every event kind.
    pub fn listen_all(mut self, listener: Arc<dyn EventListener>) -> Self {
        for kind in EventKind::ALL {
            self.listeners
                .entry(kind)
                .or_default()
                .push(Arc::clone(&listener));
        }
        self
    }

    /// Level at which every dispatch is logged.
    pub fn dispatch_level(mut self, level: Level) -> Self {
        self.dispatch_level = level;
        self
    }

    /// Level at which a panicking listener is logged.
    pub fn failure_level(mut self, level: Level) -> Self {
        self.failure_level = level;
        self
    }

    /// Freeze the dispatch table.
    pub fn build(self) -> EventDispatcher {
        EventDispatcher {
            listeners: self.listeners,
            dispatch_level: self.dispatch_level,
            failure_level: self.failure_level,
        }
    }
}

/// Immutable dispatch table from event kind to ordered listeners.
pub struct EventDispatcher {
    listeners: HashMap<EventKind, Vec<Arc<dyn EventListener>>>,
    dispatch_level: Level,
    failure_level: Level,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        EventDispatcherBuilder::new().build()
    }
}

impl EventDispatcher {
    /// Start building a dispatcher.
    pub fn builder() -> EventDispatcherBuilder {
        EventDispatcherBuilder::new()
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to its listeners in registration order.
    pub fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        let Some(listeners) = self.listeners.get(&kind) else {
            return;
        };

        log_at(self.dispatch_level, kind, listeners.len(), None);

        for (index, listener) in listeners.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if let Err(panic) = result {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log_at(self.failure_level, kind, index, Some(&reason));
            }
        }
    }
}

/// `tracing` levels are static per call site, hence one arm per level.
fn log_at(level: Level, kind: EventKind, count: usize, panic: Option<&str>) {
    let event = kind.as_str();

    macro_rules! emit {
        ($log:ident) => {
            match panic {
                None => $log!(event, listeners = count, "dispatching event"),
                Some(reason) => $log!(event, listener = count, reason, "event listener panicked"),
            }
        };
    }

    match level {
        Level::ERROR => emit!(error),
        Level::WARN => emit!(warn),
        Level::INFO => emit!(info),
        Level::DEBUG => emit!(debug),
        _ => emit!(trace),
    }
}

/// Listener that writes one structured log record per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &Event) {
        match event {
            Event::PreRun {
                schedule_key,
                occurrence,
                message,
            } => debug!(
                schedule_key = %schedule_key,
                occurrence = %occurrence,
                trace_id = ?message.trace_id(),
                "dispatching scheduled message"
            ),
            Event::PostRun {
                schedule_key,
                occurrence,
                message,
            } => info!(
                schedule_key = %schedule_key,
                occurrence = %occurrence,
                queue = %message.queue_name,
                trace_id = ?message.trace_id(),
                "scheduled message dispatched"
            ),
            Event::ScheduleFailure {
                schedule_key,
                message,
                error,
            } => error!(
                schedule_key = %schedule_key,
                kind = ?message.as_ref().and_then(|m| m.kind()),
                error = %error,
                "failed to dispatch scheduled message"
            ),
            Event::ScheduleSkipped {
                schedule_key,
                reason,
            } => trace!(schedule_key = %schedule_key, reason = %reason, "schedule skipped"),
            Event::MessageReceived {
                queue_name,
                message_id,
                message,
            } => debug!(
                queue = %queue_name,
                message_id,
                kind = ?message.kind(),
                retry_count = message.retry_count(),
                "message received"
            ),
            Event::MessageHandled {
                queue_name,
                message_id,
                message,
            } => info!(
                queue = %queue_name,
                message_id,
                kind = ?message.kind(),
                "message handled"
            ),
            Event::MessageSkipped {
                queue_name,
                message_id,
                reason,
                ..
            } => warn!(queue = %queue_name, message_id, reason = %reason, "message skipped"),
            Event::MessageFailed {
                queue_name,
                message_id,
                message,
                error,
                will_retry,
            } => {
                if *will_retry {
                    warn!(
                        queue = %queue_name,
                        message_id,
                        retry_count = message.retry_count(),
                        error = %error,
                        "message handling failed, will retry"
                    );
                } else {
                    error!(
                        queue = %queue_name,
                        message_id,
                        retry_count = message.retry_count(),
                        trace_id = ?message.trace_id(),
                        error = %error,
                        "message handling failed, moved to failed messages"
                    );
                }
            }
            Event::MessageRetried {
                queue_name,
                message_id,
                retry_count,
                available_at,
                ..
            } => info!(
                queue = %queue_name,
                message_id,
                retry_count,
                available_at = %available_at,
                "message re-enqueued"
            ),
            Event::ConsumerRateLimited {
                queues,
                retry_after,
                ..
            } => warn!(queues = ?queues, retry_after = ?retry_after, "consumer rate limited"),
        }
    }
}
