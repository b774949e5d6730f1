//! Inline transport for deterministic runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::Transport;
use crate::{HandlerRegistry, JobMessage, MessengerError};

/// Transport that handles every message inline as it is sent.
///
/// Delivery times are ignored and handler failures are returned to the
/// sender instead of going through the retry subsystem.
#[derive(Clone)]
pub struct SyncTransport {
    handlers: Arc<HandlerRegistry>,
}

impl SyncTransport {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl Transport for SyncTransport {
    async fn send_at(
        &self,
        message: JobMessage,
        _available_at: DateTime<Utc>,
    ) -> Result<(), MessengerError> {
        debug!(kind = ?message.kind(), queue = %message.queue_name, "handling message inline");
        self.handlers.dispatch(&message).await
    }
}
