//! In-memory reference stores.
//!
//! These are the reference collaborators for tests and single-process
//! deployments. Entries are replaced atomically; claims are conditional
//! updates guarded by the map shard lock, with lease timestamps so a
//! claim expires after the store's visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use qv_common::{DeadLetterContext, Message, QuiverError};
use tracing::debug;
use uuid::Uuid;

use crate::entry::{
    DeadLetterEntry, DeadLetterStats, DeadLetterStatus, InboxEntry, OutboxEntry, OutboxOptions,
    OutboxStatus, QueueEntry, QueueOptions,
};
use crate::storage::{
    DeadLetterQueue, InboxStorage, MessageStorage, OutboxStorage, QueueStorage,
};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Message storage
// ============================================================================

#[derive(Default)]
pub struct InMemoryMessageStorage {
    messages: DashMap<Uuid, Arc<dyn Message>>,
}

impl InMemoryMessageStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStorage for InMemoryMessageStorage {
    async fn store(&self, message: Arc<dyn Message>) -> qv_common::Result<Uuid> {
        let id = message.header().message_id;
        self.messages.insert(id, message);
        Ok(id)
    }

    async fn retrieve(&self, id: Uuid) -> qv_common::Result<Option<Arc<dyn Message>>> {
        Ok(self.messages.get(&id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, id: Uuid) -> qv_common::Result<bool> {
        Ok(self.messages.remove(&id).is_some())
    }
}

// ============================================================================
// Outbox
// ============================================================================

#[derive(Clone)]
struct StoredOutboxEntry {
    entry: OutboxEntry,
    claimed_at: Option<DateTime<Utc>>,
}

pub struct InMemoryOutboxStorage {
    entries: DashMap<Uuid, StoredOutboxEntry>,
    visibility_timeout: Duration,
}

impl InMemoryOutboxStorage {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            visibility_timeout,
        }
    }

    /// All entries in the given status, for inspection and tests.
    pub fn entries_with_status(&self, status: OutboxStatus) -> Vec<OutboxEntry> {
        self.entries
            .iter()
            .filter(|stored| stored.entry.status == status)
            .map(|stored| stored.entry.clone())
            .collect()
    }

    fn is_claimable(stored: &StoredOutboxEntry, now: DateTime<Utc>, visibility: Duration) -> bool {
        match stored.entry.status {
            OutboxStatus::Pending => stored
                .entry
                .next_retry_at
                .map_or(true, |due| due <= now),
            // An expired lease makes a Processing entry re-eligible
            OutboxStatus::Processing => stored.claimed_at.map_or(true, |claimed| {
                now.signed_duration_since(claimed).to_std().unwrap_or_default() >= visibility
            }),
            _ => false,
        }
    }
}

impl Default for InMemoryOutboxStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStorage for InMemoryOutboxStorage {
    async fn add(
        &self,
        message: Arc<dyn Message>,
        options: OutboxOptions,
    ) -> qv_common::Result<OutboxEntry> {
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            message,
            options,
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            created_at: Utc::now(),
            last_error: None,
        };
        self.entries.insert(
            entry.id,
            StoredOutboxEntry {
                entry: entry.clone(),
                claimed_at: None,
            },
        );
        Ok(entry)
    }

    async fn get_pending(&self, limit: usize) -> qv_common::Result<Vec<OutboxEntry>> {
        let now = Utc::now();

        // Collect candidates, then claim each under its shard lock so a
        // concurrent caller cannot claim the same entry.
        let mut candidates: Vec<(Uuid, u8, DateTime<Utc>)> = self
            .entries
            .iter()
            .filter(|stored| Self::is_claimable(stored, now, self.visibility_timeout))
            .map(|stored| {
                (
                    stored.entry.id,
                    stored.entry.options.priority,
                    stored.entry.created_at,
                )
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut claimed = Vec::new();
        for (id, _, _) in candidates {
            if claimed.len() >= limit {
                break;
            }
            if let Some(mut stored) = self.entries.get_mut(&id) {
                if Self::is_claimable(&stored, now, self.visibility_timeout) {
                    stored.entry.status = OutboxStatus::Processing;
                    stored.claimed_at = Some(now);
                    claimed.push(stored.entry.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn try_claim(&self, id: Uuid) -> qv_common::Result<Option<OutboxEntry>> {
        let now = Utc::now();
        if let Some(mut stored) = self.entries.get_mut(&id) {
            if Self::is_claimable(&stored, now, self.visibility_timeout) {
                stored.entry.status = OutboxStatus::Processing;
                stored.claimed_at = Some(now);
                return Ok(Some(stored.entry.clone()));
            }
        }
        Ok(None)
    }

    async fn mark_processed(&self, id: Uuid) -> qv_common::Result<()> {
        let mut stored = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| QuiverError::storage(format!("unknown outbox entry {id}")))?;
        stored.entry.status = OutboxStatus::Processed;
        stored.claimed_at = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> qv_common::Result<()> {
        let mut stored = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| QuiverError::storage(format!("unknown outbox entry {id}")))?;
        stored.entry.status = OutboxStatus::Failed;
        stored.entry.last_error = Some(reason.to_string());
        stored.claimed_at = None;
        Ok(())
    }

    async fn update_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> qv_common::Result<()> {
        let mut stored = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| QuiverError::storage(format!("unknown outbox entry {id}")))?;
        stored.entry.status = OutboxStatus::Pending;
        stored.entry.retry_count = retry_count;
        stored.entry.next_retry_at = Some(next_retry_at);
        stored.claimed_at = None;
        Ok(())
    }

    async fn get_pending_count(&self) -> qv_common::Result<usize> {
        Ok(self
            .entries
            .iter()
            .filter(|stored| stored.entry.status == OutboxStatus::Pending)
            .count())
    }

    async fn release_expired_claims(&self, older_than: Duration) -> qv_common::Result<u64> {
        let now = Utc::now();
        let mut released = 0;
        for mut stored in self.entries.iter_mut() {
            if stored.entry.status == OutboxStatus::Processing {
                let expired = stored.claimed_at.map_or(true, |claimed| {
                    now.signed_duration_since(claimed).to_std().unwrap_or_default() >= older_than
                });
                if expired {
                    stored.entry.status = OutboxStatus::Pending;
                    stored.claimed_at = None;
                    released += 1;
                }
            }
        }
        if released > 0 {
            debug!(released, "released expired outbox claims");
        }
        Ok(released)
    }
}

// ============================================================================
// Inbox
// ============================================================================

#[derive(Default)]
pub struct InMemoryInboxStorage {
    entries: DashMap<Uuid, InboxEntry>,
}

impl InMemoryInboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl InboxStorage for InMemoryInboxStorage {
    async fn has_been_processed(&self, id: Uuid) -> qv_common::Result<bool> {
        Ok(self.entries.contains_key(&id))
    }

    async fn mark_as_processed(&self, id: Uuid) -> qv_common::Result<bool> {
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(InboxEntry {
                    message_id: id,
                    processed_at: Utc::now(),
                });
                Ok(true)
            }
        }
    }

    async fn prune(&self, older_than: Duration) -> qv_common::Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| QuiverError::storage(e.to_string()))?;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.processed_at >= cutoff);
        Ok((before - self.entries.len()) as u64)
    }
}

// ============================================================================
// Queue
// ============================================================================

struct StoredQueueEntry {
    entry: QueueEntry,
    invisible_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<StoredQueueEntry>,
}

pub struct InMemoryQueueStorage {
    queues: DashMap<String, Mutex<QueueState>>,
    visibility_timeout: Duration,
}

impl InMemoryQueueStorage {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            visibility_timeout,
        }
    }
}

impl Default for InMemoryQueueStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn enqueue(
        &self,
        queue: &str,
        message: Arc<dyn Message>,
        options: QueueOptions,
    ) -> qv_common::Result<()> {
        let entry = QueueEntry {
            queue_name: queue.to_string(),
            message,
            enqueue_time: Utc::now(),
            priority: options.priority,
            delivery_count: 0,
        };
        let state = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Mutex::new(QueueState::default()));
        state.lock().entries.push(StoredQueueEntry {
            entry,
            invisible_until: None,
        });
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> qv_common::Result<Option<QueueEntry>> {
        let Some(state) = self.queues.get(queue) else {
            return Ok(None);
        };
        let mut state = state.lock();
        let now = Utc::now();

        // Highest priority first, then insertion order; expired claims are
        // visible again (redelivery)
        let mut best: Option<usize> = None;
        for (index, stored) in state.entries.iter().enumerate() {
            let visible = stored.invisible_until.map_or(true, |until| until <= now);
            if !visible {
                continue;
            }
            match best {
                None => best = Some(index),
                Some(current) => {
                    if stored.entry.priority > state.entries[current].entry.priority {
                        best = Some(index);
                    }
                }
            }
        }

        let Some(index) = best else {
            return Ok(None);
        };
        let visibility = chrono::Duration::from_std(self.visibility_timeout)
            .map_err(|e| QuiverError::storage(e.to_string()))?;
        let stored = &mut state.entries[index];
        stored.invisible_until = Some(now + visibility);
        stored.entry.delivery_count += 1;
        Ok(Some(stored.entry.clone()))
    }

    async fn acknowledge(&self, queue: &str, id: Uuid) -> qv_common::Result<bool> {
        let Some(state) = self.queues.get(queue) else {
            return Ok(false);
        };
        let mut state = state.lock();
        let now = Utc::now();
        let before = state.entries.len();
        // Only a currently-claimed entry can be acknowledged
        state.entries.retain(|stored| {
            !(stored.entry.message_id() == id
                && stored.invisible_until.map_or(false, |until| until > now))
        });
        Ok(state.entries.len() < before)
    }

    async fn list_queues(&self) -> qv_common::Result<Vec<String>> {
        Ok(self.queues.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn depth(&self, queue: &str) -> qv_common::Result<usize> {
        let Some(state) = self.queues.get(queue) else {
            return Ok(0);
        };
        let state = state.lock();
        let now = Utc::now();
        Ok(state
            .entries
            .iter()
            .filter(|stored| stored.invisible_until.map_or(true, |until| until <= now))
            .count())
    }
}

// ============================================================================
// Dead letter queue
// ============================================================================

/// Hook invoked with the parked message when an entry is retried.
pub type RedispatchFn =
    Arc<dyn Fn(Arc<dyn Message>) -> BoxFuture<'static, qv_common::Result<()>> + Send + Sync>;

#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    entries: DashMap<Uuid, DeadLetterEntry>,
    redispatch: Option<RedispatchFn>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries marked `Retried` are handed to `redispatch` for
    /// re-injection into a dispatcher.
    pub fn with_redispatch(redispatch: RedispatchFn) -> Self {
        Self {
            entries: DashMap::new(),
            redispatch: Some(redispatch),
        }
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn send(
        &self,
        message: Arc<dyn Message>,
        context: DeadLetterContext,
    ) -> qv_common::Result<Uuid> {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            message,
            context,
            status: DeadLetterStatus::Active,
            created_at: Utc::now(),
            retried_at: None,
            discarded_at: None,
        };
        let id = entry.id;
        self.entries.insert(id, entry);
        Ok(id)
    }

    async fn list(&self, limit: usize) -> qv_common::Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn retry(&self, id: Uuid) -> qv_common::Result<bool> {
        let message = {
            let Some(mut entry) = self.entries.get_mut(&id) else {
                return Ok(false);
            };
            if entry.status != DeadLetterStatus::Active {
                return Ok(false);
            }
            entry.status = DeadLetterStatus::Retried;
            entry.retried_at = Some(Utc::now());
            entry.message.clone()
        };

        if let Some(redispatch) = &self.redispatch {
            redispatch(message).await?;
        }
        Ok(true)
    }

    async fn discard(&self, id: Uuid) -> qv_common::Result<bool> {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Ok(false);
        };
        if entry.status != DeadLetterStatus::Active {
            return Ok(false);
        }
        entry.status = DeadLetterStatus::Discarded;
        entry.discarded_at = Some(Utc::now());
        Ok(true)
    }

    async fn count(&self) -> qv_common::Result<usize> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.status == DeadLetterStatus::Active)
            .count())
    }

    async fn statistics(&self) -> qv_common::Result<DeadLetterStats> {
        let now = Utc::now();
        let mut stats = DeadLetterStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;

        for entry in self.entries.iter() {
            stats.total += 1;
            match entry.status {
                DeadLetterStatus::Active => {
                    stats.active += 1;
                    *stats
                        .by_component
                        .entry(entry.context.component.clone())
                        .or_insert(0) += 1;
                    if oldest.map_or(true, |current| entry.created_at < current) {
                        oldest = Some(entry.created_at);
                    }
                }
                DeadLetterStatus::Retried => stats.retried += 1,
                DeadLetterStatus::Discarded => stats.discarded += 1,
            }
        }

        stats.oldest_active_age = oldest
            .map(|created| now.signed_duration_since(created).to_std().unwrap_or_default());
        Ok(stats)
    }
}

#[async_trait]
impl qv_pipeline::DeadLetterSink for InMemoryDeadLetterQueue {
    async fn send(
        &self,
        message: Arc<dyn Message>,
        context: DeadLetterContext,
    ) -> qv_common::Result<Uuid> {
        DeadLetterQueue::send(self, message, context).await
    }
}
