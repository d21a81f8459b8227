//! Error-handling decorator: the final catch-all.
//!
//! Classifies inner failures and either retries (transient, up to
//! `max_retries` with backoff), dead-letters (permanent), or escalates
//! (critical). A dead-lettered message is reported as successful to the
//! immediate caller; counters and logs carry the real outcome.
//! Cancellation passes through unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use qv_common::{
    classify, Backoff, DeadLetterContext, ErrorClass, Message, ProcessingContext,
    ProcessingResult, QuiverError,
};
use uuid::Uuid;

use crate::MessageProcessor;

/// Destination for messages the pipeline gives up on.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(
        &self,
        message: Arc<dyn Message>,
        context: DeadLetterContext,
    ) -> qv_common::Result<Uuid>;
}

#[derive(Debug, Clone)]
pub struct ErrorHandlingConfig {
    /// Inline retries for transient failures before giving up.
    pub max_retries: u32,
    /// Delay schedule between those retries.
    pub backoff: Backoff,
}

impl ErrorHandlingConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

pub struct ErrorHandlingDecorator {
    inner: Arc<dyn MessageProcessor>,
    config: ErrorHandlingConfig,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl ErrorHandlingDecorator {
    pub fn new(
        inner: Arc<dyn MessageProcessor>,
        config: ErrorHandlingConfig,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        Self {
            inner,
            config,
            dead_letter,
        }
    }

    async fn dead_letter(
        &self,
        message: Arc<dyn Message>,
        error: &QuiverError,
        ctx: &ProcessingContext,
    ) -> ProcessingResult {
        let sink = match &self.dead_letter {
            Some(sink) => sink,
            None => {
                // Nothing to park the message in; surface the failure
                return ProcessingResult::failed(error.clone());
            }
        };

        let message_id = message.header().message_id;
        let context = DeadLetterContext::new(
            "processing failed",
            error.to_string(),
            ctx.component,
            ctx.attempt,
        );

        match sink.send(message, context).await {
            Ok(entry_id) => {
                tracing::warn!(%message_id, %entry_id, %error, "message dead-lettered");
                ProcessingResult::successful()
            }
            Err(sink_error) => {
                tracing::error!(%message_id, %sink_error, "dead-letter write failed");
                ProcessingResult::failed(error.clone())
            }
        }
    }
}

#[async_trait]
impl MessageProcessor for ErrorHandlingDecorator {
    fn name(&self) -> &str {
        "error-handling"
    }

    async fn process(
        &self,
        message: Arc<dyn Message>,
        ctx: &ProcessingContext,
    ) -> ProcessingResult {
        let mut ctx = ctx.clone();

        loop {
            let result = self.inner.process(message.clone(), &ctx).await;

            let error = match &result {
                ProcessingResult::Successful { .. } => return result,
                ProcessingResult::Failed { error } => error.clone(),
            };

            match classify(&error) {
                ErrorClass::Cancellation => return result,
                ErrorClass::Critical => {
                    tracing::error!(
                        message_type = message.type_name(),
                        %error,
                        "critical failure, escalating"
                    );
                    return ProcessingResult::failed(QuiverError::Escalated(error.to_string()));
                }
                ErrorClass::Transient if ctx.attempt < self.config.max_retries => {
                    let delay = self.config.backoff.delay(ctx.attempt);
                    tracing::debug!(
                        message_type = message.type_name(),
                        attempt = ctx.attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancellation.cancelled() => {
                            return ProcessingResult::failed(QuiverError::Cancelled);
                        }
                    }
                    ctx = ctx.next_attempt();
                }
                ErrorClass::Transient | ErrorClass::Permanent => {
                    return self.dead_letter(message, &error, &ctx).await;
                }
            }
        }
    }
}
