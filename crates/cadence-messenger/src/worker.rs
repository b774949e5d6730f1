//! Consumer loop with retry and dead-letter handling.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::{
    DEFAULT_QUEUE, Event, EventDispatcher, FailedMessageStore, HandlerError, HandlerRegistry,
    MessengerError, NewFailedMessage, RateLimiter, ReceivedMessage, Receiver, RetryStrategy,
    Transport, header,
};

/// Consumer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Queues consumed, in no particular priority.
    pub queues: Vec<String>,
    /// Pause between polls when nothing is available.
    pub idle_sleep: Duration,
    /// At most `limit` messages per `interval`.
    pub rate_limit: Option<(u32, Duration)>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            idle_sleep: Duration::from_secs(1),
            rate_limit: None,
        }
    }
}

/// What a single `process_next` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Nothing was available.
    Idle,
    Handled {
        message_id: u64,
    },
    /// No handler is registered for the message kind; it was acked unhandled.
    Skipped {
        message_id: u64,
    },
    Retried {
        message_id: u64,
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered {
        message_id: u64,
        record_id: u64,
    },
    /// Throttled. `message_id` is set when the handler reported the limit
    /// and the message was put back unchanged.
    RateLimited {
        message_id: Option<u64>,
        retry_after: Duration,
    },
}

/// Pulls messages from a receiver and runs their handlers.
pub struct Worker {
    receiver: Arc<dyn Receiver>,
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
    retry: Arc<dyn RetryStrategy>,
    failed: Arc<dyn FailedMessageStore>,
    events: Arc<EventDispatcher>,
    config: WorkerConfig,
    limiter: Option<Mutex<RateLimiter>>,
}

impl Worker {
    pub fn new(
        receiver: Arc<dyn Receiver>,
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerRegistry>,
        retry: Arc<dyn RetryStrategy>,
        failed: Arc<dyn FailedMessageStore>,
        events: Arc<EventDispatcher>,
        config: WorkerConfig,
    ) -> Self {
        let limiter = config
            .rate_limit
            .map(|(limit, interval)| Mutex::new(RateLimiter::new(limit, interval)));

        Self {
            receiver,
            transport,
            handlers,
            retry,
            failed,
            events,
            config,
            limiter,
        }
    }

    /// Receive and process at most one message.
    #[tracing::instrument(skip(self))]
    pub async fn process_next(&self, now: DateTime<Utc>) -> Result<WorkerOutcome, MessengerError> {
        let throttled = match &self.limiter {
            Some(limiter) => limiter.lock().await.try_acquire(now).err(),
            None => None,
        };
        if let Some(retry_after) = throttled {
            self.events.dispatch(&Event::ConsumerRateLimited {
                queues: self.config.queues.clone(),
                retry_after,
                message: None,
            });
            return Ok(WorkerOutcome::RateLimited {
                message_id: None,
                retry_after,
            });
        }

        let Some(received) = self.receiver.receive(&self.config.queues, now).await? else {
            return Ok(WorkerOutcome::Idle);
        };

        let ReceivedMessage { id, ref message, .. } = received;
        let queue_name = message.queue_name.clone();

        self.events.dispatch(&Event::MessageReceived {
            queue_name: queue_name.clone(),
            message_id: id,
            message: message.clone(),
        });

        let handler = match self.handlers.resolve(message) {
            Ok(handler) => handler,
            Err(e) => {
                self.receiver.ack(id).await?;
                self.events.dispatch(&Event::MessageSkipped {
                    queue_name,
                    message_id: id,
                    message: message.clone(),
                    reason: e.to_string(),
                });
                return Ok(WorkerOutcome::Skipped { message_id: id });
            }
        };

        match handler.handle(message).await {
            Ok(()) => {
                self.receiver.ack(id).await?;
                self.events.dispatch(&Event::MessageHandled {
                    queue_name,
                    message_id: id,
                    message: message.clone(),
                });
                Ok(WorkerOutcome::Handled { message_id: id })
            }
            Err(HandlerError::RateLimited { retry_after }) => {
                // Never attempted: put it back as-is, counter untouched
                let available_at = now + to_chrono(retry_after)?;
                self.transport.send_at(message.clone(), available_at).await?;
                self.receiver.ack(id).await?;
                self.events.dispatch(&Event::ConsumerRateLimited {
                    queues: vec![queue_name],
                    retry_after,
                    message: Some(message.clone()),
                });
                Ok(WorkerOutcome::RateLimited {
                    message_id: Some(id),
                    retry_after,
                })
            }
            Err(e @ HandlerError::Unrecoverable(_)) => {
                self.handle_failure(&received, &e.to_string(), false, now).await
            }
            Err(e @ HandlerError::Failed(_)) => {
                self.handle_failure(&received, &e.to_string(), true, now).await
            }
        }
    }

    /// Re-enqueue a failed message or dead-letter it.
    async fn handle_failure(
        &self,
        received: &ReceivedMessage,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkerOutcome, MessengerError> {
        let message = &received.message;
        let queue_name = message.queue_name.clone();
        let attempts = message.retry_count().saturating_add(1);

        if retryable && self.retry.should_retry(attempts) {
            let delay = to_chrono(self.retry.delay_for(attempts))?;
            let floor = message.last_available_at().unwrap_or(now);
            let available_at = (now + delay).max(floor);

            let retried = message
                .clone()
                .with_retry_count(attempts)
                .with_header(header::LAST_ERROR, error)
                .with_available_at(available_at);

            // A message that cannot be re-enqueued is dead-lettered instead
            match self.transport.send_at(retried.clone(), available_at).await {
                Ok(()) => {
                    self.receiver.ack(received.id).await?;

                    self.events.dispatch(&Event::MessageFailed {
                        queue_name: queue_name.clone(),
                        message_id: received.id,
                        message: message.clone(),
                        error: error.to_string(),
                        will_retry: true,
                    });
                    self.events.dispatch(&Event::MessageRetried {
                        queue_name,
                        message_id: received.id,
                        message: retried,
                        retry_count: attempts,
                        available_at,
                    });

                    return Ok(WorkerOutcome::Retried {
                        message_id: received.id,
                        retry_count: attempts,
                        available_at,
                    });
                }
                Err(e) => {
                    warn!(
                        message_id = received.id,
                        queue = %queue_name,
                        error = %e,
                        "re-enqueue failed, dead-lettering message"
                    );
                }
            }
        }

        let exhausted = message.clone().with_retry_count(attempts);
        let record = self
            .failed
            .insert(NewFailedMessage::new(&exhausted, error, now))
            .await?;
        self.receiver.ack(received.id).await?;

        self.events.dispatch(&Event::MessageFailed {
            queue_name,
            message_id: received.id,
            message: exhausted,
            error: error.to_string(),
            will_retry: false,
        });

        Ok(WorkerOutcome::DeadLettered {
            message_id: received.id,
            record_id: record.id,
        })
    }

    /// Process messages available at `now` until none are left or the
    /// worker is throttled. Returns the outcomes in order.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<Vec<WorkerOutcome>, MessengerError> {
        let mut outcomes = Vec::new();
        loop {
            let outcome = self.process_next(now).await?;
            match outcome {
                WorkerOutcome::Idle
                | WorkerOutcome::RateLimited {
                    message_id: None, ..
                } => return Ok(outcomes),
                other => outcomes.push(other),
            }
        }
    }

    /// Consume until shutdown is signalled.
    ///
    /// Receiver errors are retried with exponential backoff.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), MessengerError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };

        info!(queues = ?self.config.queues, "worker started");

        loop {
            if *shutdown_rx.borrow() {
                info!("worker shutting down");
                return Ok(());
            }

            let wait = match self.process_next(Utc::now()).await {
                Ok(WorkerOutcome::Idle) => {
                    backoff.reset();
                    self.config.idle_sleep
                }
                Ok(WorkerOutcome::RateLimited {
                    message_id: None,
                    retry_after,
                }) => retry_after,
                Ok(outcome) => {
                    backoff.reset();
                    debug!(?outcome, "processed message");
                    continue;
                }
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    error!(error = %e, retry_in = ?wait, "worker poll failed");
                    wait
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("worker shutting down");
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, MessengerError> {
    chrono::Duration::from_std(duration).map_err(|e| MessengerError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        InMemoryTransport, JobMessage, MemoryFailedMessageStore, MultiplierRetryStrategy,
        events::EventKind,
    };
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        transport: Arc<InMemoryTransport>,
        failed: Arc<MemoryFailedMessageStore>,
        events: Arc<StdMutex<Vec<EventKind>>>,
        worker: Worker,
    }

    fn harness(handlers: HandlerRegistry, rate_limit: Option<(u32, Duration)>) -> Harness {
        let transport = Arc::new(InMemoryTransport::new());
        let failed = Arc::new(MemoryFailedMessageStore::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let recorder = seen.clone();
        let dispatcher = EventDispatcher::builder()
            .listen_all(Arc::new(move |event: &Event| {
                recorder.lock().unwrap().push(event.kind());
            }))
            .build();

        let worker = Worker::new(
            transport.clone(),
            transport.clone(),
            Arc::new(handlers),
            Arc::new(MultiplierRetryStrategy::new(3, Duration::from_secs(1), 2.0)),
            failed.clone(),
            Arc::new(dispatcher),
            WorkerConfig {
                rate_limit,
                ..Default::default()
            },
        );

        Harness {
            transport,
            failed,
            events: seen,
            worker,
        }
    }

    fn failing(reason: &'static str) -> HandlerRegistry {
        HandlerRegistry::new().with(
            "report",
            Arc::new(move |_message: JobMessage| async move {
                Err::<(), HandlerError>(HandlerError::Failed(reason.to_string()))
            }),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap()
    }

    fn report() -> JobMessage {
        JobMessage::new("report", "{}", "default").with_created_at(t0())
    }

    #[tokio::test]
    async fn test_handled_message_is_acked() {
        let handlers = HandlerRegistry::new().with(
            "report",
            Arc::new(|_message: JobMessage| async { Ok::<(), HandlerError>(()) }),
        );
        let h = harness(handlers, None);
        h.transport.send(report()).await.unwrap();

        let outcome = h.worker.process_next(t0()).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Handled { message_id: 1 });
        assert_eq!(h.transport.in_flight_len().await, 0);
        assert_eq!(
            *h.events.lock().unwrap(),
            vec![EventKind::MessageReceived, EventKind::MessageHandled]
        );
        assert_eq!(h.worker.process_next(t0()).await.unwrap(), WorkerOutcome::Idle);
    }

    #[tokio::test]
    async fn test_three_failures_dead_letter_without_fourth_enqueue() {
        let h = harness(failing("smtp down"), None);
        h.transport.send(report()).await.unwrap();

        let mut now = t0();
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            now += chrono::Duration::minutes(10);
            outcomes.push(h.worker.process_next(now).await.unwrap());
        }

        assert!(matches!(outcomes[0], WorkerOutcome::Retried { retry_count: 1, .. }));
        assert!(matches!(outcomes[1], WorkerOutcome::Retried { retry_count: 2, .. }));
        assert!(matches!(outcomes[2], WorkerOutcome::DeadLettered { .. }));

        // Original send plus two retries
        assert_eq!(h.transport.sent().await.len(), 3);
        assert_eq!(h.transport.pending_len().await, 0);

        let records = h.failed.list(&Default::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].delivered_at, None);
        assert_eq!(records[0].message().retry_count(), 3);
        assert_eq!(records[0].last_error(), Some("smtp down"));

        now += chrono::Duration::hours(1);
        assert_eq!(h.worker.process_next(now).await.unwrap(), WorkerOutcome::Idle);
    }

    #[tokio::test]
    async fn test_two_failures_increment_counter_by_two() {
        let h = harness(failing("timeout"), None);
        h.transport.send(report()).await.unwrap();

        let mut now = t0();
        for _ in 0..2 {
            now += chrono::Duration::minutes(10);
            h.worker.process_next(now).await.unwrap();
        }

        let sent = h.transport.sent().await;
        let (last, _) = sent.last().unwrap();
        assert_eq!(last.retry_count(), 2);
    }

    #[tokio::test]
    async fn test_redelivery_times_never_decrease() {
        let h = harness(failing("timeout"), None);
        h.transport.send(report()).await.unwrap();

        let mut now = t0();
        let mut times = Vec::new();
        for _ in 0..2 {
            now += chrono::Duration::minutes(10);
            if let WorkerOutcome::Retried { available_at, .. } =
                h.worker.process_next(now).await.unwrap()
            {
                times.push(available_at);
            }
        }

        assert_eq!(times.len(), 2);
        assert!(times[0] <= times[1]);
    }

    #[tokio::test]
    async fn test_handler_rate_limit_leaves_counter_untouched() {
        let handlers = HandlerRegistry::new().with(
            "report",
            Arc::new(|_message: JobMessage| async {
                Err::<(), HandlerError>(HandlerError::RateLimited {
                    retry_after: Duration::from_secs(30),
                })
            }),
        );
        let h = harness(handlers, None);
        h.transport.send(report().with_retry_count(1)).await.unwrap();

        let outcome = h.worker.process_next(t0()).await.unwrap();
        assert_eq!(
            outcome,
            WorkerOutcome::RateLimited {
                message_id: Some(1),
                retry_after: Duration::from_secs(30),
            }
        );

        let sent = h.transport.sent().await;
        let (requeued, available_at) = sent.last().unwrap();
        assert_eq!(requeued.retry_count(), 1);
        assert_eq!(*available_at, t0() + chrono::Duration::seconds(30));
        assert!(h.failed.list(&Default::default()).await.unwrap().is_empty());

        let kinds = h.events.lock().unwrap().clone();
        assert!(kinds.contains(&EventKind::ConsumerRateLimited));
        assert!(!kinds.contains(&EventKind::MessageFailed));
    }

    #[tokio::test]
    async fn test_worker_limiter_throttles_before_receiving() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handlers = HandlerRegistry::new().with(
            "report",
            Arc::new(move |_message: JobMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            }),
        );
        let h = harness(handlers, Some((1, Duration::from_secs(60))));
        h.transport.send(report()).await.unwrap();
        h.transport.send(report()).await.unwrap();

        let outcomes = h.worker.drain(t0()).await.unwrap();
        assert_eq!(outcomes, vec![WorkerOutcome::Handled { message_id: 1 }]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.pending_len().await, 1);
        assert!(h.events.lock().unwrap().contains(&EventKind::ConsumerRateLimited));
    }

    #[tokio::test]
    async fn test_unrecoverable_skips_retries() {
        let handlers = HandlerRegistry::new().with(
            "report",
            Arc::new(|_message: JobMessage| async {
                Err::<(), HandlerError>(HandlerError::Unrecoverable("bad payload".to_string()))
            }),
        );
        let h = harness(handlers, None);
        h.transport.send(report()).await.unwrap();

        let outcome = h.worker.process_next(t0()).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::DeadLettered { .. }));
        assert_eq!(h.transport.sent().await.len(), 1);
        assert_eq!(h.failed.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_message_without_handler_is_skipped() {
        let h = harness(HandlerRegistry::new(), None);
        h.transport.send(report()).await.unwrap();

        let outcome = h.worker.process_next(t0()).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Skipped { message_id: 1 });
        assert_eq!(h.transport.in_flight_len().await, 0);
        assert!(h.events.lock().unwrap().contains(&EventKind::MessageSkipped));
    }

    struct RefusingTransport;

    #[async_trait::async_trait]
    impl Transport for RefusingTransport {
        async fn send_at(
            &self,
            _message: JobMessage,
            _available_at: DateTime<Utc>,
        ) -> Result<(), MessengerError> {
            Err(MessengerError::Transport("queue offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_reenqueue_dead_letters_instead_of_stranding() {
        let queue = Arc::new(InMemoryTransport::new());
        let failed = Arc::new(MemoryFailedMessageStore::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = seen.clone();
        let dispatcher = EventDispatcher::builder()
            .listen_all(Arc::new(move |event: &Event| {
                if let Event::MessageFailed { will_retry, .. } = event {
                    recorder.lock().unwrap().push(*will_retry);
                }
            }))
            .build();

        let worker = Worker::new(
            queue.clone(),
            Arc::new(RefusingTransport),
            Arc::new(failing("smtp down")),
            Arc::new(MultiplierRetryStrategy::new(3, Duration::from_secs(1), 2.0)),
            failed.clone(),
            Arc::new(dispatcher),
            WorkerConfig::default(),
        );
        queue.send(report()).await.unwrap();

        let outcome = worker.process_next(t0()).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::DeadLettered { message_id: 1, .. }));
        assert_eq!(queue.in_flight_len().await, 0);
        assert_eq!(queue.pending_len().await, 0);

        let records = failed.list(&Default::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message().retry_count(), 1);
        assert_eq!(records[0].last_error(), Some("smtp down"));

        // Listeners never hear about a retry that was not scheduled
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(HandlerRegistry::new(), None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = h.worker;
        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
