//! Broker transport interface and the in-memory reference transport.
//!
//! Consumers acknowledge on success, negative-ack with requeue on
//! transient failure, and dead-letter on permanent failure; the handler's
//! error classification drives the choice. Connection state changes are
//! observable through a watch channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use qv_common::health::HealthStatus;
use qv_common::{classify, ErrorClass, QuiverError};
use tokio::sync::{watch, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    pub message_id: Uuid,
    pub correlation_id: Option<String>,
    pub content_type: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub routing_key: Option<String>,
}

impl TransportEnvelope {
    pub fn new(content_type: impl Into<String>, body: Bytes) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: None,
            content_type: content_type.into(),
            headers: HashMap::new(),
            body,
            routing_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Faulted,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Concurrent handler invocations per consumer.
    pub max_in_flight: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { max_in_flight: 16 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportTopology {
    pub queues: Vec<String>,
    /// Topic → queue fan-out bindings.
    pub bindings: Vec<(String, String)>,
}

pub type TransportHandler =
    Arc<dyn Fn(TransportEnvelope) -> BoxFuture<'static, qv_common::Result<()>> + Send + Sync>;

#[async_trait]
pub trait TransportConsumer: Send + Sync {
    fn source(&self) -> &str;

    async fn stop(&self);
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn connect(&self) -> qv_common::Result<()>;

    async fn disconnect(&self) -> qv_common::Result<()>;

    /// Point-to-point delivery to one queue.
    async fn send(&self, destination: &str, envelope: TransportEnvelope) -> qv_common::Result<()>;

    /// Fan-out delivery to every queue bound to the topic.
    async fn publish(&self, topic: &str, envelope: TransportEnvelope) -> qv_common::Result<()>;

    async fn subscribe(
        &self,
        source: &str,
        handler: TransportHandler,
        options: SubscribeOptions,
    ) -> qv_common::Result<Box<dyn TransportConsumer>>;

    async fn configure_topology(&self, topology: TransportTopology) -> qv_common::Result<()>;

    fn state(&self) -> TransportState;

    /// Observe connection state transitions.
    fn state_changes(&self) -> watch::Receiver<TransportState>;

    async fn health(&self) -> HealthStatus;
}

// ============================================================================
// In-memory reference transport
// ============================================================================

#[derive(Default)]
struct QueueBuffer {
    entries: Mutex<VecDeque<TransportEnvelope>>,
    wake: Notify,
}

impl QueueBuffer {
    fn push_back(&self, envelope: TransportEnvelope) {
        self.entries.lock().push_back(envelope);
        self.wake.notify_one();
    }

    fn push_front(&self, envelope: TransportEnvelope) {
        self.entries.lock().push_front(envelope);
        self.wake.notify_one();
    }

    fn pop(&self) -> Option<TransportEnvelope> {
        self.entries.lock().pop_front()
    }
}

/// Channel-backed transport for tests and single-process wiring. Honors
/// the full consumer acknowledgment contract.
pub struct InMemoryTransport {
    queues: DashMap<String, Arc<QueueBuffer>>,
    bindings: DashMap<String, Vec<String>>,
    dead_letters: Arc<Mutex<Vec<(String, TransportEnvelope)>>>,
    state_tx: watch::Sender<TransportState>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(TransportState::Disconnected);
        Self {
            queues: DashMap::new(),
            bindings: DashMap::new(),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            state_tx,
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueBuffer> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueBuffer::default()))
            .clone()
    }

    fn ensure_connected(&self) -> qv_common::Result<()> {
        if self.state() != TransportState::Connected {
            return Err(QuiverError::Transient("transport is not connected".into()));
        }
        Ok(())
    }

    /// Permanently failed envelopes, with the queue they came from.
    pub fn dead_letters(&self) -> Vec<(String, TransportEnvelope)> {
        self.dead_letters.lock().clone()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryConsumer {
    source: String,
    cancel: CancellationToken,
}

#[async_trait]
impl TransportConsumer for InMemoryConsumer {
    fn source(&self) -> &str {
        &self.source
    }

    async fn stop(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn connect(&self) -> qv_common::Result<()> {
        self.state_tx.send_replace(TransportState::Connecting);
        self.state_tx.send_replace(TransportState::Connected);
        debug!("in-memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> qv_common::Result<()> {
        self.state_tx.send_replace(TransportState::Disconnecting);
        self.state_tx.send_replace(TransportState::Disconnected);
        debug!("in-memory transport disconnected");
        Ok(())
    }

    async fn send(&self, destination: &str, envelope: TransportEnvelope) -> qv_common::Result<()> {
        self.ensure_connected()?;
        self.queue(destination).push_back(envelope);
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: TransportEnvelope) -> qv_common::Result<()> {
        self.ensure_connected()?;
        let Some(bound) = self.bindings.get(topic) else {
            debug!(topic, "no queues bound to topic");
            return Ok(());
        };
        for queue_name in bound.iter() {
            self.queue(queue_name).push_back(envelope.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        source: &str,
        handler: TransportHandler,
        options: SubscribeOptions,
    ) -> qv_common::Result<Box<dyn TransportConsumer>> {
        self.ensure_connected()?;

        let queue = self.queue(source);
        let cancel = CancellationToken::new();
        let dead_letters = self.dead_letters.clone();
        let semaphore = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
        let source_name = source.to_string();

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = match queue.pop() {
                        Some(envelope) => envelope,
                        None => {
                            tokio::select! {
                                _ = queue.wake.notified() => continue,
                                _ = cancel.cancelled() => break,
                            }
                        }
                    };

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let handler = handler.clone();
                    let queue = queue.clone();
                    let dead_letters = dead_letters.clone();
                    let source_name = source_name.clone();
                    tokio::spawn(async move {
                        let retained = envelope.clone();
                        match handler(envelope).await {
                            // Success acknowledges implicitly: the entry is gone
                            Ok(()) => {}
                            Err(handler_error) => match classify(&handler_error) {
                                ErrorClass::Transient => {
                                    debug!(
                                        source = %source_name,
                                        message_id = %retained.message_id,
                                        "transient failure, requeueing"
                                    );
                                    queue.push_front(retained);
                                }
                                _ => {
                                    warn!(
                                        source = %source_name,
                                        message_id = %retained.message_id,
                                        %handler_error,
                                        "permanent failure, dead-lettering"
                                    );
                                    dead_letters.lock().push((source_name, retained));
                                }
                            },
                        }
                        drop(permit);
                    });
                }
            });
        }

        Ok(Box::new(InMemoryConsumer {
            source: source.to_string(),
            cancel,
        }))
    }

    async fn configure_topology(&self, topology: TransportTopology) -> qv_common::Result<()> {
        for queue_name in &topology.queues {
            self.queue(queue_name);
        }
        for (topic, queue_name) in &topology.bindings {
            self.queue(queue_name);
            self.bindings
                .entry(topic.clone())
                .or_default()
                .push(queue_name.clone());
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    async fn health(&self) -> HealthStatus {
        match self.state() {
            TransportState::Connected => HealthStatus::Healthy,
            TransportState::Connecting | TransportState::Disconnecting => HealthStatus::Degraded,
            TransportState::Disconnected | TransportState::Faulted => HealthStatus::Unhealthy,
        }
    }
}
