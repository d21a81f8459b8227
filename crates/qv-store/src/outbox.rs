//! Outbox processor: durable at-least-once dispatch.
//!
//! Two cooperating activities: a poller that claims due entries in
//! batches, and a semaphore-bounded worker pool that dispatches them.
//! The poll interval adapts to load (100 ms when the last tick found
//! work, 1 s when idle, 5 s after an unexpected polling error).
//! High-priority publishes skip the poll tick entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use qv_common::{Backoff, Message, QuiverError};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entry::{OutboxEntry, OutboxOptions};
use crate::storage::OutboxStorage;

/// Routes a claimed entry to its destination. `None` destination means the
/// internal dispatcher; implementations resolve handlers in a fresh scope
/// per dispatch and acknowledge unroutable message kinds with a warning.
#[async_trait]
pub trait DestinationDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        destination: Option<&str>,
        message: Arc<dyn Message>,
    ) -> qv_common::Result<()>;
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Entries claimed per poll tick.
    pub batch_size: usize,
    /// Bounded worker-pool queue capacity.
    pub worker_capacity: usize,
    /// Concurrent dispatches. Defaults to core count.
    pub concurrency: usize,
    pub busy_poll_interval: Duration,
    pub idle_poll_interval: Duration,
    pub error_poll_interval: Duration,
    /// Retry schedule when an entry carries no fixed `retry_delay`.
    pub retry_backoff: Backoff,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            worker_capacity: 100,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            busy_poll_interval: Duration::from_millis(100),
            idle_poll_interval: Duration::from_millis(1000),
            error_poll_interval: Duration::from_secs(5),
            retry_backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboxMetricsSnapshot {
    pub polled: u64,
    pub dispatched: u64,
    pub retried: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct OutboxMetrics {
    polled: AtomicU64,
    dispatched: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    last_poll_at: RwLock<Option<DateTime<Utc>>>,
}

impl OutboxMetrics {
    fn snapshot(&self) -> OutboxMetricsSnapshot {
        OutboxMetricsSnapshot {
            polled: self.polled.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            last_poll_at: *self.last_poll_at.read(),
        }
    }
}

pub struct OutboxProcessor {
    storage: Arc<dyn OutboxStorage>,
    dispatcher: Arc<dyn DestinationDispatcher>,
    config: OutboxConfig,
    fast_path: mpsc::Sender<OutboxEntry>,
    fast_path_rx: parking_lot::Mutex<Option<mpsc::Receiver<OutboxEntry>>>,
    metrics: Arc<OutboxMetrics>,
}

impl OutboxProcessor {
    pub fn new(
        storage: Arc<dyn OutboxStorage>,
        dispatcher: Arc<dyn DestinationDispatcher>,
        config: OutboxConfig,
    ) -> Self {
        let (fast_path, fast_path_rx) = mpsc::channel(config.worker_capacity);
        Self {
            storage,
            dispatcher,
            config,
            fast_path,
            fast_path_rx: parking_lot::Mutex::new(Some(fast_path_rx)),
            metrics: Arc::new(OutboxMetrics::default()),
        }
    }

    /// Persist a message for dispatch. Entries above the priority
    /// threshold are claimed immediately and pushed into the worker pool
    /// without waiting for the next poll tick.
    pub async fn publish_to_outbox(
        &self,
        message: Arc<dyn Message>,
        options: OutboxOptions,
    ) -> qv_common::Result<OutboxEntry> {
        let high_priority = options.is_high_priority();
        let entry = self.storage.add(message, options).await?;

        if high_priority {
            if let Some(claimed) = self.storage.try_claim(entry.id).await? {
                if let Err(send_error) = self.fast_path.try_send(claimed) {
                    // Pool saturated; the claim lapses and the poller picks
                    // the entry up after the visibility timeout
                    debug!(entry_id = %entry.id, %send_error, "fast path full, deferring to poller");
                }
            }
        }

        Ok(entry)
    }

    pub fn metrics(&self) -> OutboxMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run until cancelled. Cancellation stops the poller after its
    /// current batch and waits for in-flight dispatches; entries still in
    /// `Processing` stay claimed until the store's visibility timeout
    /// makes them re-eligible.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "outbox processor starting"
        );

        let (work_tx, mut work_rx) = mpsc::channel::<OutboxEntry>(self.config.worker_capacity);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        // Worker pool: drain claimed entries, dispatch concurrently
        let pool = {
            let storage = self.storage.clone();
            let dispatcher = self.dispatcher.clone();
            let metrics = self.metrics.clone();
            let backoff = self.config.retry_backoff.clone();
            let semaphore = semaphore.clone();
            let mut fast_rx = self
                .fast_path_rx
                .lock()
                .take()
                .expect("outbox processor already running");

            let max_permits = self.config.concurrency.max(1) as u32;
            tokio::spawn(async move {
                loop {
                    let entry = tokio::select! {
                        entry = work_rx.recv() => entry,
                        entry = fast_rx.recv() => entry,
                    };
                    let Some(entry) = entry else { break };

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let storage = storage.clone();
                    let dispatcher = dispatcher.clone();
                    let metrics = metrics.clone();
                    let backoff = backoff.clone();
                    metrics.in_flight.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        process_entry(&*storage, &*dispatcher, entry, &backoff, &metrics).await;
                        metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }

                // All permits back means all in-flight dispatches finished
                let _ = semaphore.acquire_many(max_permits).await;
            })
        };

        // Poller: adaptive interval, exits after the current batch on
        // cancellation
        let mut interval = self.config.idle_poll_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }

            *self.metrics.last_poll_at.write() = Some(Utc::now());
            match self.storage.get_pending(self.config.batch_size).await {
                Ok(entries) => {
                    let found = !entries.is_empty();
                    self.metrics
                        .polled
                        .fetch_add(entries.len() as u64, Ordering::Relaxed);
                    for entry in entries {
                        if work_tx.send(entry).await.is_err() {
                            break;
                        }
                    }
                    interval = if found {
                        self.config.busy_poll_interval
                    } else {
                        self.config.idle_poll_interval
                    };
                }
                Err(poll_error) => {
                    error!(%poll_error, "outbox poll failed, backing off");
                    interval = self.config.error_poll_interval;
                }
            }
        }

        // Let in-flight work finish
        drop(work_tx);
        let _ = pool.await;
        info!("outbox processor stopped");
    }
}

async fn process_entry(
    storage: &dyn OutboxStorage,
    dispatcher: &dyn DestinationDispatcher,
    entry: OutboxEntry,
    backoff: &Backoff,
    metrics: &OutboxMetrics,
) {
    let destination = entry.options.destination.as_deref();
    debug!(entry_id = %entry.id, ?destination, "dispatching outbox entry");

    match dispatcher.dispatch(destination, entry.message.clone()).await {
        Ok(()) => {
            if let Err(update_error) = storage.mark_processed(entry.id).await {
                error!(entry_id = %entry.id, %update_error, "failed to mark entry processed");
                return;
            }
            metrics.dispatched.fetch_add(1, Ordering::Relaxed);
        }
        Err(dispatch_error) => {
            let next_retry = entry.retry_count + 1;
            if next_retry > entry.options.max_retries {
                warn!(
                    entry_id = %entry.id,
                    retries = entry.retry_count,
                    %dispatch_error,
                    "outbox entry failed permanently"
                );
                if let Err(update_error) = storage
                    .mark_failed(entry.id, &dispatch_error.to_string())
                    .await
                {
                    error!(entry_id = %entry.id, %update_error, "failed to mark entry failed");
                }
                metrics.failed.fetch_add(1, Ordering::Relaxed);
            } else {
                let delay = entry
                    .options
                    .retry_delay
                    .unwrap_or_else(|| backoff.delay(entry.retry_count));
                let due = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(30));
                debug!(
                    entry_id = %entry.id,
                    retry = next_retry,
                    delay_ms = delay.as_millis() as u64,
                    %dispatch_error,
                    "rescheduling outbox entry"
                );
                if let Err(update_error) = storage.update_retry(entry.id, next_retry, due).await {
                    error!(entry_id = %entry.id, %update_error, "failed to reschedule entry");
                }
                metrics.retried.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Convenience dispatcher that treats every entry as internally routed and
/// fails entries with an external destination. Useful where no broker
/// transport is configured.
pub struct InternalOnlyDispatcher<F> {
    dispatch: F,
}

impl<F> InternalOnlyDispatcher<F> {
    pub fn new(dispatch: F) -> Self {
        Self { dispatch }
    }
}

#[async_trait]
impl<F, Fut> DestinationDispatcher for InternalOnlyDispatcher<F>
where
    F: Fn(Arc<dyn Message>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = qv_common::Result<()>> + Send,
{
    async fn dispatch(
        &self,
        destination: Option<&str>,
        message: Arc<dyn Message>,
    ) -> qv_common::Result<()> {
        match destination {
            None => (self.dispatch)(message).await,
            Some(destination) => Err(QuiverError::handler(format!(
                "no transport configured for destination {destination}"
            ))),
        }
    }
}
