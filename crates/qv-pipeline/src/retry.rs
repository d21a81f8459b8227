//! Retry decorator. Re-invokes the inner stage on retryable failures,
//! sleeping the policy's delay in between. Cancellation during the sleep
//! returns immediately with a cancellation error.

use std::sync::Arc;

use async_trait::async_trait;
use qv_common::{Message, ProcessingContext, ProcessingResult, QuiverError, RetryPolicy};

use crate::MessageProcessor;

pub struct RetryDecorator {
    inner: Arc<dyn MessageProcessor>,
    policy: RetryPolicy,
}

impl RetryDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl MessageProcessor for RetryDecorator {
    fn name(&self) -> &str {
        "retry"
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
                ProcessingResult::Failed { error } => error,
            };

            if !self.policy.should_retry(error, ctx.attempt) {
                return result;
            }

            let delay = self.policy.delay_for(ctx.attempt);
            tracing::debug!(
                message_type = message.type_name(),
                attempt = ctx.attempt + 1,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying after failure"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => {
                    return ProcessingResult::failed(QuiverError::Cancelled);
                }
            }

            ctx = ctx.next_attempt();
        }
    }
}
