//! Outbox processor tests: at-least-once over a simulated crash, retry
//! scheduling, permanent failure, the high-priority fast path, and claim
//! exclusivity.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use qv_common::{Backoff, Message, MessageHeader, QuiverError};
use qv_store::{
    DestinationDispatcher, InMemoryOutboxStorage, OutboxConfig, OutboxOptions, OutboxProcessor,
    OutboxRecoveryTask, OutboxStatus, OutboxStorage, RecoveryConfig,
};
use tokio_util::sync::CancellationToken;

struct TestMessage {
    header: MessageHeader,
}

impl TestMessage {
    fn arc() -> Arc<dyn Message> {
        Arc::new(Self {
            header: MessageHeader::new(),
        })
    }
}

impl Message for TestMessage {
    fn header(&self) -> &MessageHeader {
        &self.header
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Records dispatched message ids; fails the first `failures` calls.
struct RecordingDispatcher {
    dispatched: parking_lot::Mutex<Vec<uuid::Uuid>>,
    failures: AtomicU32,
}

impl RecordingDispatcher {
    fn new(failures: u32) -> Self {
        Self {
            dispatched: parking_lot::Mutex::new(Vec::new()),
            failures: AtomicU32::new(failures),
        }
    }

    fn count(&self) -> usize {
        self.dispatched.lock().len()
    }
}

#[async_trait]
impl DestinationDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        _destination: Option<&str>,
        message: Arc<dyn Message>,
    ) -> qv_common::Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(QuiverError::Transient("downstream unavailable".into()));
        }
        self.dispatched.lock().push(message.header().message_id);
        Ok(())
    }
}

fn fast_config() -> OutboxConfig {
    OutboxConfig {
        busy_poll_interval: Duration::from_millis(10),
        idle_poll_interval: Duration::from_millis(20),
        error_poll_interval: Duration::from_millis(50),
        retry_backoff: Backoff::deterministic(
            Duration::from_millis(10),
            Duration::from_millis(100),
        ),
        ..OutboxConfig::default()
    }
}

async fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while !done() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn entries_are_dispatched_and_marked_processed() {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    let dispatcher = Arc::new(RecordingDispatcher::new(0));
    let processor = Arc::new(OutboxProcessor::new(
        storage.clone(),
        dispatcher.clone(),
        fast_config(),
    ));

    for _ in 0..5 {
        processor
            .publish_to_outbox(TestMessage::arc(), OutboxOptions::default())
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let runner = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel).await })
    };

    wait_until(3000, || dispatcher.count() == 5).await;
    cancel.cancel();
    runner.await.unwrap();

    assert_eq!(dispatcher.count(), 5);
    assert_eq!(storage.entries_with_status(OutboxStatus::Processed).len(), 5);
    assert_eq!(processor.metrics().dispatched, 5);
    assert_eq!(storage.get_pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn at_least_once_across_simulated_crash() {
    // Short visibility timeout so a dead claimant's entries recover fast
    let storage = Arc::new(InMemoryOutboxStorage::with_visibility_timeout(
        Duration::from_millis(100),
    ));

    let mut ids = Vec::new();
    for _ in 0..10 {
        let entry = storage
            .add(TestMessage::arc(), OutboxOptions::default())
            .await
            .unwrap();
        ids.push(entry.id);
    }

    // First processor instance claims everything, completes five, then
    // "crashes" without releasing the rest
    let claimed = storage.get_pending(10).await.unwrap();
    assert_eq!(claimed.len(), 10);
    for entry in claimed.iter().take(5) {
        storage.mark_processed(entry.id).await.unwrap();
    }

    // Remaining claims become re-eligible after the visibility timeout
    tokio::time::sleep(Duration::from_millis(150)).await;

    let dispatcher = Arc::new(RecordingDispatcher::new(0));
    let processor = Arc::new(OutboxProcessor::new(
        storage.clone(),
        dispatcher.clone(),
        fast_config(),
    ));

    let cancel = CancellationToken::new();
    let runner = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel).await })
    };

    wait_until(3000, || {
        storage.entries_with_status(OutboxStatus::Processed).len() == 10
    })
    .await;
    cancel.cancel();
    runner.await.unwrap();

    // Every entry reached Processed; the restarted instance dispatched at
    // least the five interrupted ones
    assert_eq!(storage.entries_with_status(OutboxStatus::Processed).len(), 10);
    assert!(dispatcher.count() >= 5);
    assert!(storage.entries_with_status(OutboxStatus::Pending).is_empty());
    assert!(storage
        .entries_with_status(OutboxStatus::Processing)
        .is_empty());
}

#[tokio::test]
async fn transient_failures_reschedule_then_succeed() {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    let dispatcher = Arc::new(RecordingDispatcher::new(2));
    let processor = Arc::new(OutboxProcessor::new(
        storage.clone(),
        dispatcher.clone(),
        fast_config(),
    ));

    processor
        .publish_to_outbox(
            TestMessage::arc(),
            OutboxOptions {
                max_retries: 5,
                retry_delay: Some(Duration::from_millis(10)),
                ..OutboxOptions::default()
            },
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let runner = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel).await })
    };

    wait_until(3000, || dispatcher.count() == 1).await;
    cancel.cancel();
    runner.await.unwrap();

    assert_eq!(dispatcher.count(), 1);
    assert_eq!(storage.entries_with_status(OutboxStatus::Processed).len(), 1);
    assert_eq!(processor.metrics().retried, 2);
}

#[tokio::test]
async fn exhausted_retries_mark_entry_failed() {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    let dispatcher = Arc::new(RecordingDispatcher::new(u32::MAX));
    let processor = Arc::new(OutboxProcessor::new(
        storage.clone(),
        dispatcher.clone(),
        fast_config(),
    ));

    processor
        .publish_to_outbox(
            TestMessage::arc(),
            OutboxOptions {
                max_retries: 1,
                retry_delay: Some(Duration::from_millis(5)),
                ..OutboxOptions::default()
            },
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let runner = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel).await })
    };

    wait_until(3000, || {
        !storage.entries_with_status(OutboxStatus::Failed).is_empty()
    })
    .await;
    cancel.cancel();
    runner.await.unwrap();

    let failed = storage.entries_with_status(OutboxStatus::Failed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .last_error
        .as_deref()
        .is_some_and(|reason| reason.contains("downstream unavailable")));
    assert_eq!(processor.metrics().failed, 1);
}

#[tokio::test]
async fn high_priority_skips_the_poll_tick() {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    let dispatcher = Arc::new(RecordingDispatcher::new(0));
    // Idle interval long enough that only the fast path can deliver quickly
    let processor = Arc::new(OutboxProcessor::new(
        storage.clone(),
        dispatcher.clone(),
        OutboxConfig {
            idle_poll_interval: Duration::from_secs(10),
            busy_poll_interval: Duration::from_secs(10),
            ..fast_config()
        },
    ));

    let cancel = CancellationToken::new();
    let runner = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel).await })
    };
    // Give the worker pool a moment to come up
    tokio::time::sleep(Duration::from_millis(20)).await;

    processor
        .publish_to_outbox(
            TestMessage::arc(),
            OutboxOptions {
                priority: 8,
                ..OutboxOptions::default()
            },
        )
        .await
        .unwrap();

    wait_until(1000, || dispatcher.count() == 1).await;
    cancel.cancel();
    runner.await.unwrap();

    assert_eq!(dispatcher.count(), 1);
    assert_eq!(storage.entries_with_status(OutboxStatus::Processed).len(), 1);
}

#[tokio::test]
async fn internal_only_dispatcher_rejects_external_destinations() {
    use qv_store::InternalOnlyDispatcher;

    let storage = Arc::new(InMemoryOutboxStorage::new());
    let delivered = Arc::new(AtomicU32::new(0));
    let dispatcher = {
        let delivered = delivered.clone();
        Arc::new(InternalOnlyDispatcher::new(move |_message| {
            let delivered = delivered.clone();
            async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok::<(), QuiverError>(())
            }
        }))
    };
    let processor = Arc::new(OutboxProcessor::new(storage.clone(), dispatcher, fast_config()));

    processor
        .publish_to_outbox(TestMessage::arc(), OutboxOptions::default())
        .await
        .unwrap();
    processor
        .publish_to_outbox(
            TestMessage::arc(),
            OutboxOptions {
                destination: Some("amqp://orders".into()),
                max_retries: 0,
                ..OutboxOptions::default()
            },
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let runner = {
        let processor = processor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel).await })
    };

    wait_until(3000, || {
        storage.entries_with_status(OutboxStatus::Processed).len() == 1
            && storage.entries_with_status(OutboxStatus::Failed).len() == 1
    })
    .await;
    cancel.cancel();
    runner.await.unwrap();

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(storage.entries_with_status(OutboxStatus::Processed).len(), 1);
    let failed = storage.entries_with_status(OutboxStatus::Failed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .last_error
        .as_deref()
        .is_some_and(|reason| reason.contains("no transport configured")));
}

#[tokio::test]
async fn concurrent_claims_never_overlap() {
    let storage = Arc::new(InMemoryOutboxStorage::new());
    for _ in 0..20 {
        storage
            .add(TestMessage::arc(), OutboxOptions::default())
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(storage.get_pending(20), storage.get_pending(20));
    let a = a.unwrap();
    let b = b.unwrap();

    let ids_a: HashSet<_> = a.iter().map(|e| e.id).collect();
    let ids_b: HashSet<_> = b.iter().map(|e| e.id).collect();
    assert_eq!(a.len() + b.len(), 20);
    assert!(ids_a.is_disjoint(&ids_b));
}

#[tokio::test]
async fn recovery_task_releases_stuck_claims() {
    let storage = Arc::new(InMemoryOutboxStorage::with_visibility_timeout(
        Duration::from_secs(300),
    ));
    storage
        .add(TestMessage::arc(), OutboxOptions::default())
        .await
        .unwrap();

    let claimed = storage.get_pending(1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(storage.entries_with_status(OutboxStatus::Processing).len(), 1);

    let recovery = OutboxRecoveryTask::new(
        storage.clone(),
        RecoveryConfig {
            stuck_timeout: Duration::from_millis(0),
            ..RecoveryConfig::default()
        },
    );
    recovery.recover_once().await;

    assert_eq!(storage.entries_with_status(OutboxStatus::Pending).len(), 1);
    assert!(storage
        .entries_with_status(OutboxStatus::Processing)
        .is_empty());
}
