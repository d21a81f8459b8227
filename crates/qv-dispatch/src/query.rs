//! Query dispatcher. Same single-worker shape as the command dispatcher,
//! with a typed response and a rolling latency window (last 100 samples)
//! published as `average_duration_ms`. The cache-hit counter is
//! incremented by the caller's pipeline, not by the dispatcher itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use qv_common::metrics::ComponentMetrics;
use qv_common::{Message, ProcessingContext, ProcessingResult, Query, QuiverError};
use qv_pipeline::{PipelineBuilder, TerminalFn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::{run_worker, DispatchJob};
use crate::registry::HandlerRegistry;
use crate::DISPATCH_QUEUE_CAPACITY;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryMetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub cache_hits: u64,
}

pub struct QueryDispatcher {
    tx: mpsc::Sender<DispatchJob>,
    shutdown: CancellationToken,
    metrics: Arc<ComponentMetrics>,
    cache_hits: AtomicU64,
}

impl QueryDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, pipeline: PipelineBuilder) -> Self {
        let terminal: TerminalFn = Arc::new(move |message: Arc<dyn Message>, ctx| {
            let registry = registry.clone();
            Box::pin(async move {
                let type_id = message.as_any().type_id();
                match registry.resolve_query(type_id) {
                    Some(invoker) => invoker(message, ctx).await,
                    None => ProcessingResult::failed(QuiverError::NoHandlerRegistered(
                        message.type_name().to_string(),
                    )),
                }
            })
        });
        let processor = pipeline.build(terminal);

        let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(ComponentMetrics::new());

        tokio::spawn(run_worker(
            rx,
            processor,
            shutdown.clone(),
            metrics.clone(),
            "query",
        ));

        Self {
            tx,
            shutdown,
            metrics,
            cache_hits: AtomicU64::new(0),
        }
    }

    pub async fn fetch<Q: Query>(&self, query: Q) -> qv_common::Result<Q::Response> {
        self.fetch_cancellable(query, CancellationToken::new()).await
    }

    pub async fn fetch_cancellable<Q: Query>(
        &self,
        query: Q,
        cancellation: CancellationToken,
    ) -> qv_common::Result<Q::Response> {
        if self.shutdown.is_cancelled() {
            return Err(QuiverError::ShutdownInProgress);
        }
        if cancellation.is_cancelled() {
            return Err(QuiverError::Cancelled);
        }

        let type_name = std::any::type_name::<Q>();
        let message: Arc<dyn Message> = Arc::new(query);
        let ctx = ProcessingContext::with_cancellation("QueryDispatcher", cancellation.clone());
        let (reply_tx, reply_rx) = oneshot::channel();

        let job = DispatchJob {
            message,
            type_name,
            ctx,
            reply: reply_tx,
        };

        tokio::select! {
            sent = self.tx.send(job) => {
                sent.map_err(|_| QuiverError::ShutdownInProgress)?;
            }
            _ = cancellation.cancelled() => {
                debug!(query = type_name, "fetch cancelled before enqueue");
                return Err(QuiverError::Cancelled);
            }
        }

        let result = reply_rx
            .await
            .map_err(|_| QuiverError::ShutdownInProgress)?;
        result.into_response::<Q::Response>()?.ok_or_else(|| {
            QuiverError::handler("query pipeline completed without a response value")
        })
    }

    /// Caller-side cache layers report their hits here.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> QueryMetricsSnapshot {
        let base = self.metrics.snapshot();
        QueryMetricsSnapshot {
            processed: base.processed,
            failed: base.failed,
            average_duration_ms: base.average_duration_ms,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
