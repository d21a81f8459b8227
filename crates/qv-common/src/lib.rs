use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod health;
pub mod logging;
pub mod metrics;
pub mod retry;

pub use retry::{classify, Backoff, ErrorClass, RetryPolicy};

// ============================================================================
// Message Model
// ============================================================================

/// Identity and tracing data shared by every message.
///
/// `message_id` is assigned at creation and never changes. `correlation_id`
/// groups messages belonging to one logical conversation; `causation_id`
/// points at the message that triggered this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MessageHeader {
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_correlation(correlation_id: impl Into<String>) -> Self {
        let mut header = Self::new();
        header.correlation_id = Some(correlation_id.into());
        header
    }

    /// Header for a message caused by `parent`: inherits the correlation id,
    /// records the parent as causation.
    pub fn caused_by(parent: &MessageHeader) -> Self {
        let mut header = Self::new();
        header.correlation_id = parent.correlation_id.clone();
        header.causation_id = Some(parent.message_id);
        header
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Common supertype of all traffic flowing through the dispatchers.
///
/// Implementations are plain structs embedding a [`MessageHeader`]. The
/// `as_any` accessor supports the type-keyed handler registry; handlers
/// always see the concrete type.
pub trait Message: Send + Sync + 'static {
    fn header(&self) -> &MessageHeader;

    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str {
        std::any::type_name_of_val(self)
    }
}

/// A message with at most one handler. Delivery is in-order, serialized per
/// dispatcher instance.
pub trait Command: Message {
    type Response: Send + 'static;
}

/// A message with exactly one handler and a typed response. Semantically
/// read-only.
pub trait Query: Message {
    type Response: Send + 'static;
}

/// A message with zero or more handlers, delivered fan-out.
pub trait Event: Message {}

// ============================================================================
// Processing Context & Result
// ============================================================================

/// Immutable per-dispatch record handed to every pipeline stage and handler.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub started_at: Instant,
    /// Retry attempt, 0 for the first invocation.
    pub attempt: u32,
    /// Component that initiated the dispatch ("CommandDispatcher", "EventBus", ...).
    pub component: &'static str,
    pub cancellation: CancellationToken,
    pub attributes: HashMap<String, String>,
}

impl ProcessingContext {
    pub fn new(component: &'static str) -> Self {
        Self {
            started_at: Instant::now(),
            attempt: 0,
            component,
            cancellation: CancellationToken::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_cancellation(component: &'static str, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..Self::new(component)
        }
    }

    /// Copy of this context for the next retry attempt.
    pub fn next_attempt(&self) -> Self {
        let mut ctx = self.clone();
        ctx.attempt += 1;
        ctx
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Outcome of one pipeline pass.
///
/// Every stage returns a `ProcessingResult`; failures never cross a stage
/// boundary as panics or raw errors. A successful result may carry the
/// handler's response value for typed command/query dispatch.
pub enum ProcessingResult {
    Successful { response: Option<Box<dyn Any + Send>> },
    Failed { error: QuiverError },
}

impl ProcessingResult {
    pub fn successful() -> Self {
        Self::Successful { response: None }
    }

    pub fn with_response(response: Box<dyn Any + Send>) -> Self {
        Self::Successful {
            response: Some(response),
        }
    }

    pub fn failed(error: QuiverError) -> Self {
        Self::Failed { error }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Successful { .. })
    }

    pub fn error(&self) -> Option<&QuiverError> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Successful { .. } => None,
        }
    }

    /// Consume the result, yielding the typed response or the failure.
    pub fn into_response<R: 'static>(self) -> Result<Option<R>> {
        match self {
            Self::Successful { response } => Ok(response
                .and_then(|boxed| boxed.downcast::<R>().ok())
                .map(|boxed| *boxed)),
            Self::Failed { error } => Err(error),
        }
    }
}

impl std::fmt::Debug for ProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Successful { response } => f
                .debug_struct("Successful")
                .field("has_response", &response.is_some())
                .finish(),
            Self::Failed { error } => f.debug_struct("Failed").field("error", error).finish(),
        }
    }
}

// ============================================================================
// Dead Letter Context
// ============================================================================

/// Failure provenance attached to a dead-lettered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterContext {
    pub reason: String,
    pub exception_summary: String,
    /// Component that gave up on the message.
    pub component: String,
    pub retry_count: u32,
    pub failure_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DeadLetterContext {
    pub fn new(
        reason: impl Into<String>,
        exception_summary: impl Into<String>,
        component: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            reason: reason.into(),
            exception_summary: exception_summary.into(),
            component: component.into(),
            retry_count,
            failure_time: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error taxonomy shared across the workspace.
///
/// The pipeline converts raw handler failures into one of these kinds at
/// stage boundaries; only `Escalated` and infrastructure faults propagate
/// past the top of the pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuiverError {
    #[error("no handler registered for {0}")]
    NoHandlerRegistered(String),

    #[error("validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("dead-lettered: {0}")]
    DeadLettered(String),

    #[error("escalated: {0}")]
    Escalated(String),

    #[error("saga concurrency conflict on {correlation_id}: expected version {expected}, found {actual}")]
    SagaConcurrency {
        correlation_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {message}")]
    Storage {
        message: String,
        /// Backend-specific error code, when the storage driver surfaces one.
        code: Option<i32>,
    },

    #[error("queue at capacity: {0}")]
    QueueAtCapacity(String),
}

impl QuiverError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            code: None,
        }
    }

    pub fn storage_with_code(message: impl Into<String>, code: i32) -> Self {
        Self::Storage {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::HandlerFailed(message.into())
    }
}

pub type Result<T> = std::result::Result<T, QuiverError>;
