//! External error-handler hook for the event bus.
//!
//! When delivery to one subscriber fails, the bus hands the failure
//! context to the configured handler, which decides the next step. With
//! no handler configured the bus falls back to internal exponential
//! backoff.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qv_common::QuiverError;

/// Failure context for one subscriber's delivery attempt.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub retry_count: u32,
    pub max_retries: u32,
    pub component: &'static str,
    pub first_failure_time: DateTime<Utc>,
    pub last_failure_time: DateTime<Utc>,
    /// Carries `event_type` and `handler_type`.
    pub metadata: HashMap<String, String>,
}

/// Decision returned by an [`ErrorHandler`].
#[derive(Debug, Clone)]
pub enum ErrorAction {
    /// Sleep for the delay, then re-invoke the handler.
    Retry(Duration),
    /// Park the event; the envelope is dropped and counted as failed.
    SendToDeadLetter(String),
    /// Drop the envelope; counted as failed.
    Discard(String),
    /// Propagate the failure out of the delivery loop.
    Escalate,
}

#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, error: &QuiverError, context: &ErrorContext) -> ErrorAction;
}
