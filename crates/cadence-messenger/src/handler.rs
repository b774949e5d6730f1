//! Message handlers and the kind-to-handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::{JobMessage, MessengerError};

/// Outcome of a failed handling attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The attempt failed; the retry policy decides what happens next.
    #[error("{0}")]
    Failed(String),

    /// The message can never succeed; retries are skipped.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// The downstream is throttling; the message was not attempted.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration },
}

/// Consumer-side processing for one message kind.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &JobMessage) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(JobMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &JobMessage) -> Result<(), HandlerError> {
        self(message.clone()).await
    }
}

/// Immutable mapping from message kind to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a message kind, replacing any previous one.
    pub fn with(mut self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Find the handler for a message.
    pub fn resolve(&self, message: &JobMessage) -> Result<Arc<dyn MessageHandler>, MessengerError> {
        let kind = message.kind().unwrap_or_default();
        self.get(kind)
            .ok_or_else(|| MessengerError::NoHandler(kind.to_string()))
    }

    /// Handle a message inline.
    pub async fn dispatch(&self, message: &JobMessage) -> Result<(), MessengerError> {
        let handler = self.resolve(message)?;
        handler.handle(message).await?;
        Ok(())
    }
}

/// Handler that records each message in the log and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageHandler;

#[async_trait]
impl MessageHandler for LogMessageHandler {
    async fn handle(&self, message: &JobMessage) -> Result<(), HandlerError> {
        info!(
            kind = ?message.kind(),
            queue = %message.queue_name,
            trace_id = ?message.trace_id(),
            body = %message.body,
            "handled message"
        );
        Ok(())
    }
}
