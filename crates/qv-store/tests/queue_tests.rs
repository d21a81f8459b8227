//! Queue processor tests: FIFO ordering, priority precedence, redelivery
//! after a lapsed claim, and drain-on-stop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use qv_common::{Message, MessageHeader, QuiverError};
use qv_store::{
    InMemoryQueueStorage, QueueDispatchFn, QueueOptions, QueueProcessor, QueueProcessorConfig,
};

struct TestMessage {
    header: MessageHeader,
    label: String,
}

impl TestMessage {
    fn arc(label: impl Into<String>) -> Arc<dyn Message> {
        Arc::new(Self {
            header: MessageHeader::new(),
            label: label.into(),
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

fn label_of(message: &dyn Message) -> String {
    message
        .as_any()
        .downcast_ref::<TestMessage>()
        .map(|m| m.label.clone())
        .unwrap_or_default()
}

fn recording_dispatch(seen: Arc<parking_lot::Mutex<Vec<String>>>) -> QueueDispatchFn {
    Arc::new(move |message| {
        let seen = seen.clone();
        Box::pin(async move {
            seen.lock().push(label_of(message.as_ref()));
            Ok(())
        })
    })
}

fn fast_config() -> QueueProcessorConfig {
    QueueProcessorConfig {
        concurrency: 1,
        poll_interval: Duration::from_millis(10),
        error_poll_interval: Duration::from_millis(50),
    }
}

async fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while !done() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_worker_preserves_insertion_order() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let processor = QueueProcessor::new(storage, recording_dispatch(seen.clone()), fast_config());

    for i in 0..5 {
        processor
            .enqueue(
                TestMessage::arc(format!("m{i}")),
                "orders",
                QueueOptions::default(),
            )
            .await
            .unwrap();
    }

    processor.start_queue("orders").unwrap();
    wait_until(2000, || seen.lock().len() == 5).await;
    processor.stop_queue("orders").await.unwrap();

    assert_eq!(*seen.lock(), vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[tokio::test]
async fn priority_takes_precedence_over_insertion_order() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let processor = QueueProcessor::new(storage, recording_dispatch(seen.clone()), fast_config());

    processor
        .enqueue(TestMessage::arc("low"), "orders", QueueOptions { priority: 0 })
        .await
        .unwrap();
    processor
        .enqueue(
            TestMessage::arc("high"),
            "orders",
            QueueOptions { priority: 9 },
        )
        .await
        .unwrap();

    processor.start_queue("orders").unwrap();
    wait_until(2000, || seen.lock().len() == 2).await;
    processor.stop_queue("orders").await.unwrap();

    assert_eq!(*seen.lock(), vec!["high", "low"]);
}

#[tokio::test]
async fn unacknowledged_entries_are_redelivered() {
    let storage = Arc::new(InMemoryQueueStorage::with_visibility_timeout(
        Duration::from_millis(100),
    ));
    let attempts = Arc::new(AtomicU32::new(0));

    let dispatch: QueueDispatchFn = {
        let attempts = attempts.clone();
        Arc::new(move |_message| {
            let attempts = attempts.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(QuiverError::Transient("first delivery fails".into()))
                } else {
                    Ok(())
                }
            })
        })
    };

    let processor = QueueProcessor::new(storage, dispatch, fast_config());
    processor
        .enqueue(TestMessage::arc("m"), "orders", QueueOptions::default())
        .await
        .unwrap();

    processor.start_queue("orders").unwrap();
    wait_until(3000, || attempts.load(Ordering::SeqCst) >= 2).await;

    let metrics = processor.queue_metrics("orders").await.unwrap();
    processor.stop_queue("orders").await.unwrap();

    assert!(attempts.load(Ordering::SeqCst) >= 2);
    assert_eq!(metrics.failed, 1);
    assert!(metrics.redelivered >= 1);
}

#[tokio::test]
async fn stop_queue_awaits_in_flight_work() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let finished = Arc::new(AtomicU32::new(0));

    let dispatch: QueueDispatchFn = {
        let finished = finished.clone();
        Arc::new(move |_message| {
            let finished = finished.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    };

    let processor = QueueProcessor::new(storage, dispatch, fast_config());
    processor
        .enqueue(TestMessage::arc("slow"), "orders", QueueOptions::default())
        .await
        .unwrap();
    processor.start_queue("orders").unwrap();

    // Let the worker pick the entry up, then stop: stop must block until
    // the in-flight dispatch finishes
    tokio::time::sleep(Duration::from_millis(30)).await;
    processor.stop_queue("orders").await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(processor.active_queues().is_empty());
}

#[tokio::test]
async fn active_queues_reflects_lifecycle() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let processor = QueueProcessor::new(storage, recording_dispatch(seen), fast_config());

    assert!(processor.active_queues().is_empty());
    processor.start_queue("a").unwrap();
    processor.start_queue("b").unwrap();

    let mut active = processor.active_queues();
    active.sort();
    assert_eq!(active, vec!["a", "b"]);

    processor.stop_queue("a").await.unwrap();
    assert_eq!(processor.active_queues(), vec!["b"]);

    assert!(processor.stop_queue("missing").await.is_err());
    processor.stop_queue("b").await.unwrap();
}

#[tokio::test]
async fn queues_drain_independently() {
    let storage = Arc::new(InMemoryQueueStorage::new());
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let processor = QueueProcessor::new(storage, recording_dispatch(seen.clone()), fast_config());

    processor
        .enqueue(TestMessage::arc("a1"), "queue-a", QueueOptions::default())
        .await
        .unwrap();
    processor
        .enqueue(TestMessage::arc("b1"), "queue-b", QueueOptions::default())
        .await
        .unwrap();

    // Only queue-a is started; queue-b's entry stays put
    processor.start_queue("queue-a").unwrap();
    wait_until(2000, || seen.lock().len() == 1).await;

    assert_eq!(*seen.lock(), vec!["a1"]);
    let depth_b = processor.queue_metrics("queue-b").await.unwrap().depth;
    assert_eq!(depth_b, 1);

    processor.stop_queue("queue-a").await.unwrap();
}
