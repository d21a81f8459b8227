//! Event bus: parallel fan-out delivery with per-handler retry.
//!
//! Publishing enqueues one envelope per subscriber into a bounded queue;
//! a dispatcher task drains it into a semaphore-bounded pool so at most
//! `concurrency` handler invocations run at once. Envelopes are
//! independent: one failing handler never blocks its siblings. There is
//! no inter-handler ordering; within a single handler's retry loop,
//! attempts are strictly sequential.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use qv_common::{Backoff, Event, Message, ProcessingContext, ProcessingResult};
use qv_pipeline::{MessageProcessor, PipelineBuilder, TerminalFn};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error_handler::{ErrorAction, ErrorContext, ErrorHandler};
use crate::registry::HandlerRegistry;
use crate::EVENT_QUEUE_CAPACITY;

#[derive(Clone)]
pub struct EventBusConfig {
    /// Delivery attempts per handler before giving up (internal-backoff
    /// mode); also reported to the external error handler.
    pub max_retries: u32,
    pub queue_capacity: usize,
    /// Maximum concurrent handler invocations. Defaults to core count.
    pub concurrency: usize,
    /// Delay schedule for internal retries (no external handler).
    pub retry_backoff: Backoff,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            queue_capacity: EVENT_QUEUE_CAPACITY,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            retry_backoff: Backoff::deterministic(
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(30),
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBusMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub escalated: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct EventBusMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    escalated: AtomicU64,
    cancelled: AtomicU64,
}

impl EventBusMetrics {
    fn snapshot(&self) -> EventBusMetricsSnapshot {
        EventBusMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// A subscription with its pipeline built around the handler invoker.
#[derive(Clone)]
struct BuiltSubscription {
    handler_name: &'static str,
    processor: Arc<dyn MessageProcessor>,
}

struct Envelope {
    event: Arc<dyn Message>,
    event_type: &'static str,
    subscription: BuiltSubscription,
    cancellation: CancellationToken,
}

pub struct EventBus {
    subscriptions: HashMap<TypeId, Vec<BuiltSubscription>>,
    tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    metrics: Arc<EventBusMetrics>,
}

impl EventBus {
    pub fn new(registry: Arc<HandlerRegistry>, config: EventBusConfig) -> Self {
        Self::with_pipeline(registry, config, PipelineBuilder::minimal(), None)
    }

    /// Build the bus with a pipeline profile applied around every
    /// subscription and an optional external error handler.
    pub fn with_pipeline(
        registry: Arc<HandlerRegistry>,
        config: EventBusConfig,
        pipeline: PipelineBuilder,
        error_handler: Option<Arc<dyn ErrorHandler>>,
    ) -> Self {
        let mut subscriptions: HashMap<TypeId, Vec<BuiltSubscription>> = HashMap::new();
        for (type_id, subs) in registry.subscribed_event_types() {
            let built = subs
                .iter()
                .map(|sub| {
                    let invoker = sub.invoker.clone();
                    let terminal: TerminalFn =
                        Arc::new(move |message, ctx| invoker(message, ctx));
                    BuiltSubscription {
                        handler_name: sub.handler_name,
                        processor: pipeline.clone().build(terminal),
                    }
                })
                .collect();
            subscriptions.insert(type_id, built);
        }

        let (tx, mut rx) = mpsc::channel::<Envelope>(config.queue_capacity);
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(EventBusMetrics::default());
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));

        {
            let shutdown = shutdown.clone();
            let metrics = metrics.clone();
            let config = config.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = tokio::select! {
                        envelope = rx.recv() => match envelope {
                            Some(envelope) => envelope,
                            None => break,
                        },
                        _ = shutdown.cancelled() => break,
                    };

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let metrics = metrics.clone();
                    let config = config.clone();
                    let error_handler = error_handler.clone();
                    tokio::spawn(async move {
                        deliver(envelope, &config, error_handler, &metrics).await;
                        drop(permit);
                    });
                }
                debug!("event bus dispatcher stopped");
            });
        }

        Self {
            subscriptions,
            tx,
            shutdown,
            metrics,
        }
    }

    /// Publish an event to every subscriber of its type. Completes once
    /// all envelopes are enqueued; handler failures are observable through
    /// metrics only.
    pub async fn publish<E: Event>(&self, event: E) -> qv_common::Result<()> {
        self.publish_cancellable(event, CancellationToken::new())
            .await
    }

    /// As [`publish`](Self::publish), with a caller-owned cancellation
    /// signal. Cancelling prevents further enqueueing and interrupts any
    /// in-flight retry delay; already-started handlers see the signal but
    /// are not aborted.
    pub async fn publish_cancellable<E: Event>(
        &self,
        event: E,
        cancellation: CancellationToken,
    ) -> qv_common::Result<()> {
        let event: Arc<dyn Message> = Arc::new(event);
        self.publish_erased(event, cancellation).await
    }

    /// Publish an already-erased event, as the durable processors do when
    /// re-injecting stored entries. Subscribers are resolved by the
    /// message's concrete type.
    pub async fn publish_erased(
        &self,
        event: Arc<dyn Message>,
        cancellation: CancellationToken,
    ) -> qv_common::Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(qv_common::QuiverError::ShutdownInProgress);
        }
        if cancellation.is_cancelled() {
            return Err(qv_common::QuiverError::Cancelled);
        }

        let event_type = event.type_name();
        let subs = self
            .subscriptions
            .get(&event.as_any().type_id())
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        if subs.is_empty() {
            debug!(event_type, "no subscribers for event");
        }

        for subscription in subs {
            let envelope = Envelope {
                event: event.clone(),
                event_type,
                subscription: subscription.clone(),
                cancellation: cancellation.clone(),
            };
            tokio::select! {
                sent = self.tx.send(envelope) => {
                    if sent.is_err() {
                        return Err(qv_common::QuiverError::ShutdownInProgress);
                    }
                }
                _ = cancellation.cancelled() => {
                    return Err(qv_common::QuiverError::Cancelled);
                }
            }
        }

        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics(&self) -> EventBusMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Per-envelope delivery loop with retries. Attempts are sequential; the
/// external error handler (when present) owns the retry decision.
async fn deliver(
    envelope: Envelope,
    config: &EventBusConfig,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    metrics: &EventBusMetrics,
) {
    let Envelope {
        event,
        event_type,
        subscription,
        cancellation,
    } = envelope;

    let mut attempt: u32 = 0;
    let mut first_failure: Option<DateTime<Utc>> = None;

    loop {
        if cancellation.is_cancelled() {
            metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut ctx = ProcessingContext::with_cancellation("EventBus", cancellation.clone());
        ctx.attempt = attempt;

        let result = subscription.processor.process(event.clone(), &ctx).await;

        let delivery_error = match result {
            ProcessingResult::Successful { .. } => {
                metrics.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            ProcessingResult::Failed { error } => error,
        };

        attempt += 1;
        let now = Utc::now();
        let first = *first_failure.get_or_insert(now);

        match &error_handler {
            Some(handler) => {
                let mut metadata = HashMap::new();
                metadata.insert("event_type".to_string(), event_type.to_string());
                metadata.insert(
                    "handler_type".to_string(),
                    subscription.handler_name.to_string(),
                );
                let context = ErrorContext {
                    retry_count: attempt,
                    max_retries: config.max_retries,
                    component: "EventBus",
                    first_failure_time: first,
                    last_failure_time: now,
                    metadata,
                };

                match handler.on_error(&delivery_error, &context).await {
                    ErrorAction::Retry(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancellation.cancelled() => {
                                metrics.cancelled.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                        }
                    }
                    ErrorAction::SendToDeadLetter(reason) => {
                        warn!(
                            event_type,
                            handler = subscription.handler_name,
                            reason,
                            "event delivery dead-lettered"
                        );
                        metrics.failed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    ErrorAction::Discard(reason) => {
                        info!(
                            event_type,
                            handler = subscription.handler_name,
                            reason,
                            "event delivery discarded"
                        );
                        metrics.failed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    ErrorAction::Escalate => {
                        error!(
                            event_type,
                            handler = subscription.handler_name,
                            error = %delivery_error,
                            "event delivery escalated"
                        );
                        metrics.escalated.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            None => {
                if attempt >= config.max_retries {
                    warn!(
                        event_type,
                        handler = subscription.handler_name,
                        attempts = attempt,
                        error = %delivery_error,
                        "event delivery failed after retries"
                    );
                    metrics.failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let delay = config.retry_backoff.delay(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => {
                        metrics.cancelled.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
    }
}
