//! Inbox processor: idempotent reception.
//!
//! The inbox is a precondition gate. `accept` records the message id
//! first (atomic test-and-set at the store boundary), and only a
//! first-seen message reaches the dispatch closure; duplicates are
//! dropped and counted. Concurrent duplicate arrivals are resolved by the
//! store's conditional insert.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use qv_common::Message;
use tracing::debug;

use crate::storage::InboxStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxDecision {
    /// First sighting; the message was dispatched.
    Dispatched,
    /// The id was already recorded; the message was dropped.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboxMetricsSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub failed: u64,
}

impl InboxMetricsSnapshot {
    pub fn deduplication_rate(&self) -> f64 {
        let seen = self.processed + self.duplicates;
        if seen == 0 {
            0.0
        } else {
            self.duplicates as f64 / seen as f64
        }
    }
}

pub struct InboxProcessor {
    storage: Arc<dyn InboxStorage>,
    processed: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
}

impl InboxProcessor {
    pub fn new(storage: Arc<dyn InboxStorage>) -> Self {
        Self {
            storage,
            processed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Gate `message` through the dedup store, dispatching on first
    /// sight. The handler chain runs at most once per message id across
    /// the lifetime of the inbox store, even when the dispatch itself
    /// fails.
    pub async fn accept<F, Fut>(
        &self,
        message: Arc<dyn Message>,
        dispatch: F,
    ) -> qv_common::Result<InboxDecision>
    where
        F: FnOnce(Arc<dyn Message>) -> Fut,
        Fut: Future<Output = qv_common::Result<()>>,
    {
        let message_id = message.header().message_id;

        if !self.storage.mark_as_processed(message_id).await? {
            debug!(%message_id, "duplicate message dropped");
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(InboxDecision::Duplicate);
        }

        match dispatch(message).await {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                Ok(InboxDecision::Dispatched)
            }
            Err(dispatch_error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(dispatch_error)
            }
        }
    }

    pub fn metrics(&self) -> InboxMetricsSnapshot {
        InboxMetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
