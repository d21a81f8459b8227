//! Validation decorator. Any validator failure short-circuits without
//! invoking downstream stages.

use std::sync::Arc;

use async_trait::async_trait;
use qv_common::{Message, ProcessingContext, ProcessingResult, QuiverError};

use crate::MessageProcessor;

/// Checks a message before it reaches the handler. Validators see the
/// erased message and downcast to the types they care about; unknown types
/// pass.
#[async_trait]
pub trait MessageValidator: Send + Sync {
    fn name(&self) -> &str;

    /// Empty vec means valid.
    async fn validate(&self, message: &dyn Message, ctx: &ProcessingContext) -> Vec<String>;
}

pub struct ValidationDecorator {
    inner: Arc<dyn MessageProcessor>,
    validators: Vec<Arc<dyn MessageValidator>>,
}

impl ValidationDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, validators: Vec<Arc<dyn MessageValidator>>) -> Self {
        Self { inner, validators }
    }
}

#[async_trait]
impl MessageProcessor for ValidationDecorator {
    fn name(&self) -> &str {
        "validation"
    }

    async fn process(
        &self,
        message: Arc<dyn Message>,
        ctx: &ProcessingContext,
    ) -> ProcessingResult {
        let mut failures = Vec::new();
        for validator in &self.validators {
            let mut messages = validator.validate(message.as_ref(), ctx).await;
            if !messages.is_empty() {
                tracing::debug!(
                    validator = validator.name(),
                    message_type = message.type_name(),
                    failures = messages.len(),
                    "validation failed"
                );
                failures.append(&mut messages);
            }
        }

        if !failures.is_empty() {
            return ProcessingResult::failed(QuiverError::ValidationFailed(failures));
        }

        self.inner.process(message, ctx).await
    }
}
