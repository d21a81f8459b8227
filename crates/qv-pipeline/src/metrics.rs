//! Metrics decorator: success/failure counters and duration averages per
//! message type.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use qv_common::metrics::{ComponentMetrics, ComponentMetricsSnapshot};
use qv_common::{Message, ProcessingContext, ProcessingResult};

use crate::MessageProcessor;

#[derive(Default)]
pub struct PipelineMetrics {
    per_type: DashMap<&'static str, ComponentMetrics>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, message_type: &'static str, success: bool, duration_ms: u64) {
        let entry = self.per_type.entry(message_type).or_default();
        if success {
            entry.record_success(duration_ms);
        } else {
            entry.record_failure(duration_ms);
        }
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        let per_type = self
            .per_type
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().snapshot()))
            .collect();
        PipelineMetricsSnapshot { per_type }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineMetricsSnapshot {
    pub per_type: std::collections::HashMap<String, ComponentMetricsSnapshot>,
}

impl PipelineMetricsSnapshot {
    pub fn for_type(&self, message_type: &str) -> Option<&ComponentMetricsSnapshot> {
        self.per_type.get(message_type)
    }
}

pub struct MetricsDecorator {
    inner: Arc<dyn MessageProcessor>,
    metrics: Arc<PipelineMetrics>,
}

impl MetricsDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl MessageProcessor for MetricsDecorator {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn process(
        &self,
        message: Arc<dyn Message>,
        ctx: &ProcessingContext,
    ) -> ProcessingResult {
        let message_type = message.type_name();
        let start = std::time::Instant::now();

        let result = self.inner.process(message, ctx).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        self.metrics
            .record(message_type, result.is_successful(), duration_ms);

        result
    }
}
