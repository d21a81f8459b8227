//! Durable entry types for the outbox, inbox, queue, and dead-letter
//! stores.
//!
//! Entries are owned by their store; processors receive clones and signal
//! updates through explicit store operations. In-memory stores replace
//! entries atomically rather than mutating them in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qv_common::{DeadLetterContext, Message};
use uuid::Uuid;

/// Priority above which an outbox entry takes the fast path into the
/// worker pool without waiting for the next poll tick.
pub const HIGH_PRIORITY_THRESHOLD: u8 = 5;

// ============================================================================
// Outbox
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutboxOptions {
    /// 0–10; above [`HIGH_PRIORITY_THRESHOLD`] skips the poll tick.
    pub priority: u8,
    /// External destination; `None` routes through the internal dispatcher.
    pub destination: Option<String>,
    pub max_retries: u32,
    /// Fixed retry delay; `None` uses the processor's backoff schedule.
    pub retry_delay: Option<Duration>,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            destination: None,
            max_retries: 3,
            retry_delay: None,
        }
    }
}

impl OutboxOptions {
    pub fn is_high_priority(&self) -> bool {
        self.priority > HIGH_PRIORITY_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }
}

#[derive(Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub message: Arc<dyn Message>,
    pub options: OutboxOptions,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl std::fmt::Debug for OutboxEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxEntry")
            .field("id", &self.id)
            .field("message_type", &self.message.type_name())
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("next_retry_at", &self.next_retry_at)
            .finish()
    }
}

// ============================================================================
// Inbox
// ============================================================================

/// Dedup record: at most one per `message_id` across the store's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxEntry {
    pub message_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    pub priority: u8,
}

#[derive(Clone)]
pub struct QueueEntry {
    pub queue_name: String,
    pub message: Arc<dyn Message>,
    pub enqueue_time: DateTime<Utc>,
    pub priority: u8,
    /// Incremented on every dequeue, including redeliveries.
    pub delivery_count: u32,
}

impl QueueEntry {
    pub fn message_id(&self) -> Uuid {
        self.message.header().message_id
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("queue_name", &self.queue_name)
            .field("message_id", &self.message_id())
            .field("priority", &self.priority)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

// ============================================================================
// Dead Letter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeadLetterStatus {
    Active,
    Retried,
    Discarded,
}

#[derive(Clone)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub message: Arc<dyn Message>,
    pub context: DeadLetterContext,
    pub status: DeadLetterStatus,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for DeadLetterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterEntry")
            .field("id", &self.id)
            .field("message_type", &self.message.type_name())
            .field("status", &self.status)
            .field("reason", &self.context.reason)
            .finish()
    }
}

/// Aggregate view over the dead-letter store.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterStats {
    pub total: u64,
    pub active: u64,
    pub retried: u64,
    pub discarded: u64,
    /// Active entries per originating component.
    pub by_component: HashMap<String, u64>,
    pub oldest_active_age: Option<Duration>,
}
