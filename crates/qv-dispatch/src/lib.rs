//! Dispatchers: command, query, and event routing to registered handlers.
//!
//! Commands and queries run on a single-worker loop with a bounded
//! submission queue, which is the only ordering guarantee at this layer.
//! Events fan out over a parallel worker pool. All three dispatch through
//! a processing pipeline built at construction time.

pub mod command;
pub mod error_handler;
pub mod event;
pub mod query;
pub mod registry;

pub use command::CommandDispatcher;
pub use error_handler::{ErrorAction, ErrorContext, ErrorHandler};
pub use event::{EventBus, EventBusConfig, EventBusMetricsSnapshot};
pub use query::{QueryDispatcher, QueryMetricsSnapshot};
pub use registry::{
    CommandHandler, EventHandler, HandlerRegistry, HandlerRegistryBuilder, QueryHandler,
};

/// Submission queue capacity for command and query dispatchers.
pub const DISPATCH_QUEUE_CAPACITY: usize = 100;

/// Envelope queue capacity for the event bus.
pub const EVENT_QUEUE_CAPACITY: usize = 1000;
