//! Queue processor: named, long-lived FIFO queues for workload
//! decoupling.
//!
//! Each started queue gets its own drain task and a semaphore-bounded
//! worker pool. Workers dequeue (which claims with a visibility timeout),
//! dispatch, then acknowledge; an unacknowledged entry is redelivered
//! once its claim lapses. Per queue, dequeue order is priority first,
//! then insertion order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use qv_common::metrics::LatencyWindow;
use qv_common::{Message, QuiverError};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entry::QueueOptions;
use crate::storage::QueueStorage;

pub type QueueDispatchFn =
    Arc<dyn Fn(Arc<dyn Message>) -> BoxFuture<'static, qv_common::Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueProcessorConfig {
    /// Worker-pool degree per queue.
    pub concurrency: usize,
    /// Idle wait between polls of an empty queue.
    pub poll_interval: Duration,
    /// Backoff after a storage error.
    pub error_poll_interval: Duration,
}

impl Default for QueueProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(100),
            error_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMetricsSnapshot {
    pub depth: usize,
    pub in_flight: u64,
    pub processed: u64,
    pub failed: u64,
    pub redelivered: u64,
    pub average_processing_ms: f64,
}

#[derive(Default)]
struct QueueWorkerMetrics {
    in_flight: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    redelivered: AtomicU64,
    latency: LatencyWindow,
}

struct QueueHandle {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    metrics: Arc<QueueWorkerMetrics>,
    task: JoinHandle<()>,
}

pub struct QueueProcessor {
    storage: Arc<dyn QueueStorage>,
    dispatch: QueueDispatchFn,
    config: QueueProcessorConfig,
    queues: DashMap<String, QueueHandle>,
}

impl QueueProcessor {
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        dispatch: QueueDispatchFn,
        config: QueueProcessorConfig,
    ) -> Self {
        Self {
            storage,
            dispatch,
            config,
            queues: DashMap::new(),
        }
    }

    /// Persist a message onto `queue_name` and wake its pool if running.
    pub async fn enqueue(
        &self,
        message: Arc<dyn Message>,
        queue_name: &str,
        options: QueueOptions,
    ) -> qv_common::Result<()> {
        self.storage.enqueue(queue_name, message, options).await?;
        if let Some(handle) = self.queues.get(queue_name) {
            handle.wake.notify_one();
        }
        Ok(())
    }

    /// Create the worker pool for `name` and begin draining. Starting an
    /// already-running queue is a no-op.
    pub fn start_queue(&self, name: &str) -> qv_common::Result<()> {
        self.start_queue_with_concurrency(name, self.config.concurrency)
    }

    pub fn start_queue_with_concurrency(
        &self,
        name: &str,
        concurrency: usize,
    ) -> qv_common::Result<()> {
        if self.queues.contains_key(name) {
            debug!(queue = name, "queue already started");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let metrics = Arc::new(QueueWorkerMetrics::default());

        let task = tokio::spawn(drain_queue(
            name.to_string(),
            self.storage.clone(),
            self.dispatch.clone(),
            self.config.clone(),
            concurrency.max(1),
            cancel.clone(),
            wake.clone(),
            metrics.clone(),
        ));

        info!(queue = name, concurrency, "queue started");
        self.queues.insert(
            name.to_string(),
            QueueHandle {
                cancel,
                wake,
                metrics,
                task,
            },
        );
        Ok(())
    }

    /// Signal completion and await drain of in-flight work. Entries still
    /// in the store stay there for the next start.
    pub async fn stop_queue(&self, name: &str) -> qv_common::Result<()> {
        let Some((_, handle)) = self.queues.remove(name) else {
            return Err(QuiverError::storage(format!("queue {name} is not running")));
        };
        handle.cancel.cancel();
        handle.wake.notify_one();
        if let Err(join_error) = handle.task.await {
            warn!(queue = name, %join_error, "queue drain task panicked");
        }
        info!(queue = name, "queue stopped");
        Ok(())
    }

    pub fn active_queues(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn queue_metrics(&self, name: &str) -> qv_common::Result<QueueMetricsSnapshot> {
        let depth = self.storage.depth(name).await?;
        let mut snapshot = QueueMetricsSnapshot {
            depth,
            ..Default::default()
        };
        if let Some(handle) = self.queues.get(name) {
            let metrics = &handle.metrics;
            snapshot.in_flight = metrics.in_flight.load(Ordering::Relaxed);
            snapshot.processed = metrics.processed.load(Ordering::Relaxed);
            snapshot.failed = metrics.failed.load(Ordering::Relaxed);
            snapshot.redelivered = metrics.redelivered.load(Ordering::Relaxed);
            snapshot.average_processing_ms = metrics.latency.average_ms();
        }
        Ok(snapshot)
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_queue(
    name: String,
    storage: Arc<dyn QueueStorage>,
    dispatch: QueueDispatchFn,
    config: QueueProcessorConfig,
    concurrency: usize,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    metrics: Arc<QueueWorkerMetrics>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match storage.dequeue(&name).await {
            Ok(Some(entry)) => {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                if entry.delivery_count > 1 {
                    metrics.redelivered.fetch_add(1, Ordering::Relaxed);
                }

                let storage = storage.clone();
                let dispatch = dispatch.clone();
                let metrics = metrics.clone();
                let queue = name.clone();
                metrics.in_flight.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    let message_id = entry.message_id();
                    let start = std::time::Instant::now();

                    match dispatch(entry.message.clone()).await {
                        Ok(()) => {
                            // Ack only after successful processing
                            match storage.acknowledge(&queue, message_id).await {
                                Ok(true) => {
                                    metrics.processed.fetch_add(1, Ordering::Relaxed);
                                    metrics
                                        .latency
                                        .record(start.elapsed().as_millis() as u64);
                                }
                                Ok(false) => {
                                    // Claim lapsed mid-dispatch; the entry will
                                    // be redelivered
                                    warn!(queue, %message_id, "acknowledge raced a lapsed claim");
                                }
                                Err(ack_error) => {
                                    error!(queue, %message_id, %ack_error, "acknowledge failed");
                                }
                            }
                        }
                        Err(dispatch_error) => {
                            warn!(queue, %message_id, %dispatch_error, "queue dispatch failed");
                            metrics.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = wake.notified() => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Err(dequeue_error) => {
                error!(queue = name, %dequeue_error, "dequeue failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(config.error_poll_interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    // Drain: wait for every in-flight worker to hand its permit back
    let _ = semaphore.acquire_many(concurrency as u32).await;
    debug!(queue = name, "queue drained");
}
