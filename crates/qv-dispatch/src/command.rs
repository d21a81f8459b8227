//! Command dispatcher: a single-slot worker over a bounded queue.
//!
//! Submissions block when the queue is full (backpressure). Processing
//! concurrency is exactly one, so handlers observe FIFO submission order
//! per dispatcher instance. Each submission completes a caller-visible
//! oneshot when the pipeline returns.

use std::sync::Arc;

use qv_common::metrics::{ComponentMetrics, ComponentMetricsSnapshot};
use qv_common::{Command, Message, ProcessingContext, ProcessingResult, QuiverError};
use qv_pipeline::{MessageProcessor, PipelineBuilder, TerminalFn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::HandlerRegistry;
use crate::DISPATCH_QUEUE_CAPACITY;

pub(crate) struct DispatchJob {
    pub message: Arc<dyn Message>,
    pub type_name: &'static str,
    pub ctx: ProcessingContext,
    pub reply: oneshot::Sender<ProcessingResult>,
}

pub struct CommandDispatcher {
    tx: mpsc::Sender<DispatchJob>,
    shutdown: CancellationToken,
    metrics: Arc<ComponentMetrics>,
}

impl CommandDispatcher {
    /// Build the dispatcher and start its worker. Handler resolution
    /// happens per dispatch inside the pipeline terminal, so a missing
    /// registration surfaces as `NoHandlerRegistered` at send time.
    pub fn new(registry: Arc<HandlerRegistry>, pipeline: PipelineBuilder) -> Self {
        let terminal: TerminalFn = Arc::new(move |message: Arc<dyn Message>, ctx| {
            let registry = registry.clone();
            Box::pin(async move {
                let type_id = message.as_any().type_id();
                match registry.resolve_command(type_id) {
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
            "command",
        ));

        Self {
            tx,
            shutdown,
            metrics,
        }
    }

    /// Dispatch a fire-and-forget command; resolves when the handler has
    /// run. A dead-lettered command resolves successfully.
    pub async fn send<C>(&self, command: C) -> qv_common::Result<()>
    where
        C: Command<Response = ()>,
    {
        self.dispatch(command, CancellationToken::new())
            .await
            .map(|_| ())
    }

    /// Dispatch a command expecting a typed response.
    pub async fn send_with_response<C: Command>(
        &self,
        command: C,
    ) -> qv_common::Result<C::Response> {
        self.dispatch(command, CancellationToken::new())
            .await
            .and_then(|response| {
                response.ok_or_else(|| {
                    QuiverError::handler("pipeline completed without a response value")
                })
            })
    }

    /// As [`send`](Self::send), with a caller-owned cancellation signal.
    /// Cancelling before enqueue prevents the enqueue; cancelling later
    /// requests (does not force) the handler to stop.
    pub async fn send_cancellable<C>(
        &self,
        command: C,
        cancellation: CancellationToken,
    ) -> qv_common::Result<()>
    where
        C: Command<Response = ()>,
    {
        self.dispatch(command, cancellation).await.map(|_| ())
    }

    /// Dispatch an already-erased message, as the durable processors do
    /// when re-injecting stored entries. Resolves when the handler has
    /// run; any response value is dropped.
    pub async fn send_erased(&self, message: Arc<dyn Message>) -> qv_common::Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(QuiverError::ShutdownInProgress);
        }

        let type_name = message.type_name();
        let ctx = ProcessingContext::new("CommandDispatcher");
        let (reply_tx, reply_rx) = oneshot::channel();

        let job = DispatchJob {
            message,
            type_name,
            ctx,
            reply: reply_tx,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| QuiverError::ShutdownInProgress)?;

        let result = reply_rx
            .await
            .map_err(|_| QuiverError::ShutdownInProgress)?;
        match result {
            ProcessingResult::Successful { .. } => Ok(()),
            ProcessingResult::Failed { error } => Err(error),
        }
    }

    async fn dispatch<C: Command>(
        &self,
        command: C,
        cancellation: CancellationToken,
    ) -> qv_common::Result<Option<C::Response>> {
        if self.shutdown.is_cancelled() {
            return Err(QuiverError::ShutdownInProgress);
        }
        if cancellation.is_cancelled() {
            return Err(QuiverError::Cancelled);
        }

        let type_name = std::any::type_name::<C>();
        let message: Arc<dyn Message> = Arc::new(command);
        let ctx = ProcessingContext::with_cancellation("CommandDispatcher", cancellation.clone());
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
                debug!(command = type_name, "dispatch cancelled before enqueue");
                return Err(QuiverError::Cancelled);
            }
        }

        let result = reply_rx
            .await
            .map_err(|_| QuiverError::ShutdownInProgress)?;
        result.into_response::<C::Response>()
    }

    pub fn metrics(&self) -> ComponentMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop accepting submissions and stop the worker. Queued but
    /// unprocessed submissions fail with `ShutdownInProgress`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub(crate) async fn run_worker(
    mut rx: mpsc::Receiver<DispatchJob>,
    processor: Arc<dyn MessageProcessor>,
    shutdown: CancellationToken,
    metrics: Arc<ComponentMetrics>,
    kind: &'static str,
) {
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let start = std::time::Instant::now();
        let result = processor.process(job.message, &job.ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            ProcessingResult::Successful { .. } => metrics.record_success(duration_ms),
            ProcessingResult::Failed { error } => {
                warn!(message_type = job.type_name, %error, kind, "handler failed");
                metrics.record_failure(duration_ms);
            }
        }

        // Caller may have gone away; that is not an error here
        let _ = job.reply.send(result);
    }

    debug!(kind, "dispatch worker stopped");
}
