//! Durable messaging: outbox, inbox, queue, and dead-letter stores plus
//! the processors that drive them.
//!
//! Storage backends are capability traits ([`storage`]); the in-memory
//! implementations ([`memory`]) are reference collaborators with real
//! claim/lease semantics. Processors interpose the stores in front of the
//! dispatchers for at-least-once delivery (outbox), idempotent reception
//! (inbox), and workload decoupling (queues).

pub mod entry;
pub mod inbox;
pub mod memory;
pub mod outbox;
pub mod queue;
pub mod recovery;
pub mod storage;

pub use entry::{
    DeadLetterEntry, DeadLetterStats, DeadLetterStatus, InboxEntry, OutboxEntry, OutboxOptions,
    OutboxStatus, QueueEntry, QueueOptions, HIGH_PRIORITY_THRESHOLD,
};
pub use inbox::{InboxDecision, InboxMetricsSnapshot, InboxProcessor};
pub use memory::{
    InMemoryDeadLetterQueue, InMemoryInboxStorage, InMemoryMessageStorage, InMemoryOutboxStorage,
    InMemoryQueueStorage, DEFAULT_VISIBILITY_TIMEOUT,
};
pub use outbox::{
    DestinationDispatcher, InternalOnlyDispatcher, OutboxConfig, OutboxMetricsSnapshot,
    OutboxProcessor,
};
pub use queue::{QueueDispatchFn, QueueMetricsSnapshot, QueueProcessor, QueueProcessorConfig};
pub use recovery::{OutboxRecoveryTask, RecoveryConfig};
pub use storage::{DeadLetterQueue, InboxStorage, MessageStorage, OutboxStorage, QueueStorage};
