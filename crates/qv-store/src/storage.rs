//! Storage capability interfaces.
//!
//! Every boundary is a replaceable trait; the in-memory implementations in
//! [`crate::memory`] are the reference collaborators. Backends must honor
//! the claim semantics documented on each method: entries handed out by
//! `get_pending`/`dequeue` are exclusively claimed by the caller for the
//! store's visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qv_common::{DeadLetterContext, Message};
use uuid::Uuid;

use crate::entry::{DeadLetterEntry, DeadLetterStats, OutboxEntry, OutboxOptions, QueueEntry, QueueOptions};

/// General message persistence.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    async fn store(&self, message: Arc<dyn Message>) -> qv_common::Result<Uuid>;

    async fn retrieve(&self, id: Uuid) -> qv_common::Result<Option<Arc<dyn Message>>>;

    /// Returns false when the id was absent.
    async fn delete(&self, id: Uuid) -> qv_common::Result<bool>;
}

/// Durable outgoing-message buffer.
#[async_trait]
pub trait OutboxStorage: Send + Sync {
    async fn add(
        &self,
        message: Arc<dyn Message>,
        options: OutboxOptions,
    ) -> qv_common::Result<OutboxEntry>;

    /// Claim up to `limit` due entries. Returned entries are transitioned
    /// to `Processing` and invisible to other callers until released,
    /// resolved, or the visibility timeout lapses. Two processor instances
    /// must never both receive the same entry.
    async fn get_pending(&self, limit: usize) -> qv_common::Result<Vec<OutboxEntry>>;

    /// Claim one specific entry if it is still claimable. Used by the
    /// high-priority fast path.
    async fn try_claim(&self, id: Uuid) -> qv_common::Result<Option<OutboxEntry>>;

    async fn mark_processed(&self, id: Uuid) -> qv_common::Result<()>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> qv_common::Result<()>;

    /// Record a failed attempt and reschedule: status back to `Pending`
    /// with the given retry count and due time.
    async fn update_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> qv_common::Result<()>;

    async fn get_pending_count(&self) -> qv_common::Result<usize>;

    /// Return entries stuck in `Processing` longer than `older_than` to
    /// `Pending`. Returns how many were released. Drives crash recovery.
    async fn release_expired_claims(&self, older_than: Duration) -> qv_common::Result<u64>;
}

/// Dedup gate for incoming messages.
#[async_trait]
pub trait InboxStorage: Send + Sync {
    async fn has_been_processed(&self, id: Uuid) -> qv_common::Result<bool>;

    /// Atomic first-seen test-and-set: true when this call created the
    /// record, false when the id was already marked. Marking twice yields
    /// the same store state as marking once.
    async fn mark_as_processed(&self, id: Uuid) -> qv_common::Result<bool>;

    /// Drop dedup records older than the horizon; returns removed count.
    async fn prune(&self, older_than: Duration) -> qv_common::Result<u64>;
}

/// Named FIFO queues.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        message: Arc<dyn Message>,
        options: QueueOptions,
    ) -> qv_common::Result<()>;

    /// Claim the next entry (priority, then insertion order). The entry is
    /// invisible to other consumers until acknowledged or the visibility
    /// timeout lapses, after which it is redelivered.
    async fn dequeue(&self, queue: &str) -> qv_common::Result<Option<QueueEntry>>;

    /// Remove a claimed entry. Returns false when the id is not claimed.
    async fn acknowledge(&self, queue: &str, id: Uuid) -> qv_common::Result<bool>;

    async fn list_queues(&self) -> qv_common::Result<Vec<String>>;

    /// Visible (unclaimed) depth of a queue.
    async fn depth(&self, queue: &str) -> qv_common::Result<usize>;
}

/// Parking lot for messages that could not be processed.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn send(
        &self,
        message: Arc<dyn Message>,
        context: DeadLetterContext,
    ) -> qv_common::Result<Uuid>;

    /// Most recent entries first, any status.
    async fn list(&self, limit: usize) -> qv_common::Result<Vec<DeadLetterEntry>>;

    /// Mark an active entry `Retried` and hand its message back for
    /// re-dispatch. Returns false when the entry is missing or not active.
    async fn retry(&self, id: Uuid) -> qv_common::Result<bool>;

    /// Mark an active entry `Discarded`.
    async fn discard(&self, id: Uuid) -> qv_common::Result<bool>;

    /// Number of active entries.
    async fn count(&self) -> qv_common::Result<usize>;

    async fn statistics(&self) -> qv_common::Result<DeadLetterStats>;
}
