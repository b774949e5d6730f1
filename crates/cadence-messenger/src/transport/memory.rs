//! In-process async queue.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Receiver, Transport, effective_available_at};
use crate::{JobMessage, MessengerError, ReceivedMessage, validate_queue_name};

#[derive(Default)]
struct QueueState {
    next_id: u64,
    pending: Vec<ReceivedMessage>,
    in_flight: HashMap<u64, ReceivedMessage>,
    sent: VecDeque<(JobMessage, DateTime<Utc>)>,
}

/// Number of accepted messages kept in the send history.
pub const SENT_HISTORY_LIMIT: usize = 1024;

/// Queue held in process memory.
///
/// Also keeps a history of the most recently accepted messages (at most
/// [`SENT_HISTORY_LIMIT`]), which tests use to observe what producers sent.
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<QueueState>,
}

impl InMemoryTransport {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recently accepted messages, oldest first, with their delivery time.
    pub async fn sent(&self) -> Vec<(JobMessage, DateTime<Utc>)> {
        self.state.lock().await.sent.iter().cloned().collect()
    }

    /// Number of messages waiting to be received.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Number of messages received but not yet acked or rejected.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_at(
        &self,
        message: JobMessage,
        available_at: DateTime<Utc>,
    ) -> Result<(), MessengerError> {
        validate_queue_name(&message.queue_name)?;
        let available_at = effective_available_at(&message, available_at);

        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        if state.sent.len() == SENT_HISTORY_LIMIT {
            state.sent.pop_front();
        }
        state.sent.push_back((message.clone(), available_at));
        state.pending.push(ReceivedMessage {
            id,
            message,
            available_at,
        });
        Ok(())
    }
}

#[async_trait]
impl Receiver for InMemoryTransport {
    async fn receive(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<ReceivedMessage>, MessengerError> {
        let mut state = self.state.lock().await;

        let next = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, m)| m.available_at <= now && queues.contains(&m.message.queue_name))
            .min_by_key(|(_, m)| (m.available_at, m.id))
            .map(|(index, _)| index);

        let Some(index) = next else {
            return Ok(None);
        };

        let received = state.pending.remove(index);
        state.in_flight.insert(received.id, received.clone());
        Ok(Some(received))
    }

    async fn ack(&self, id: u64) -> Result<(), MessengerError> {
        self.state.lock().await.in_flight.remove(&id);
        Ok(())
    }

    async fn reject(&self, id: u64) -> Result<(), MessengerError> {
        self.state.lock().await.in_flight.remove(&id);
        Ok(())
    }
}
