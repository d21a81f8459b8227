//! Saga orchestration: correlation-keyed, persistent state machines with
//! compensation.
//!
//! Events routed through the orchestrator load (or create) the saga for
//! their correlation id, run the matching transition, and persist the
//! result under optimistic concurrency. Compensating actions registered
//! during earlier transitions run LIFO when a step fails or an action
//! asks for them.

use chrono::{DateTime, Utc};

pub mod compensation;
pub mod machine;
pub mod orchestrator;
pub mod repository;

pub use compensation::{CompensationFn, CompensationStack};
pub use machine::{
    StateContext, StateMachineDefinition, StateMachineDefinitionBuilder, Transition,
    TransitionAction,
};
pub use orchestrator::{
    CorrelationExtractor, SagaMetricsSnapshot, SagaOrchestrator, SagaOrchestratorConfig,
    SagaOutcome,
};
pub use repository::{InMemorySagaRepository, SagaRepository};

/// A persistent workflow instance. `version` is the optimistic-concurrency
/// token: every successful update increments it, and an update against a
/// stale version fails without mutating state.
#[derive(Debug, Clone)]
pub struct Saga<S> {
    pub correlation_id: String,
    pub current_state: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_completed: bool,
    /// Domain fields.
    pub data: S,
}

impl<S: Default> Saga<S> {
    pub fn new(correlation_id: impl Into<String>, initial_state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            current_state: initial_state.into(),
            version: 0,
            created_at: now,
            updated_at: now,
            is_completed: false,
            data: S::default(),
        }
    }
}
