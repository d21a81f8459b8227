//! Logging decorator: a start event, then a success or failure event with
//! the elapsed time. Payload logging serializes the message header only.

use std::sync::Arc;

use async_trait::async_trait;
use qv_common::{Message, ProcessingContext, ProcessingResult};
use tracing::Level;

use crate::MessageProcessor;

pub struct LoggingDecorator {
    inner: Arc<dyn MessageProcessor>,
    level: Level,
    include_payload: bool,
}

impl LoggingDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, level: Level, include_payload: bool) -> Self {
        Self {
            inner,
            level,
            include_payload,
        }
    }

    fn debug_level(&self) -> bool {
        self.level == Level::DEBUG || self.level == Level::TRACE
    }
}

#[async_trait]
impl MessageProcessor for LoggingDecorator {
    fn name(&self) -> &str {
        "logging"
    }

    async fn process(
        &self,
        message: Arc<dyn Message>,
        ctx: &ProcessingContext,
    ) -> ProcessingResult {
        let message_id = message.header().message_id;
        let message_type = message.type_name();

        if self.include_payload {
            let header = serde_json::to_string(message.header()).unwrap_or_default();
            if self.debug_level() {
                tracing::debug!(%message_id, message_type, header, "processing message");
            } else {
                tracing::info!(%message_id, message_type, header, "processing message");
            }
        } else if self.debug_level() {
            tracing::debug!(%message_id, message_type, "processing message");
        } else {
            tracing::info!(%message_id, message_type, "processing message");
        }

        let start = std::time::Instant::now();
        let result = self.inner.process(message, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            ProcessingResult::Successful { .. } => {
                if self.debug_level() {
                    tracing::debug!(%message_id, message_type, duration_ms, "message processed");
                } else {
                    tracing::info!(%message_id, message_type, duration_ms, "message processed");
                }
            }
            ProcessingResult::Failed { error } => {
                tracing::warn!(%message_id, message_type, duration_ms, %error, "message processing failed");
            }
        }

        result
    }
}
