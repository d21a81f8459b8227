//! Saga orchestrator: routes events to workflow instances.
//!
//! Correlation comes from the message header when present, otherwise from
//! a registered extractor. The matching transition runs with the
//! instance's compensation stack; persistence goes through the repository
//! under optimistic concurrency, and a version conflict retries the whole
//! dispatch with fresh state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use qv_common::{Message, QuiverError};
use tracing::{debug, info, warn};

use crate::compensation::CompensationStack;
use crate::machine::{StateContext, StateMachineDefinition};
use crate::repository::SagaRepository;
use crate::Saga;

/// Fallback correlation-id extraction for events whose header carries
/// none.
pub type CorrelationExtractor = Arc<dyn Fn(&dyn Message) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SagaOrchestratorConfig {
    /// Whole-dispatch retries after a version conflict.
    pub conflict_retries: u32,
    /// Run the compensation stack automatically when a transition action
    /// fails.
    pub compensate_on_action_error: bool,
}

impl Default for SagaOrchestratorConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 3,
            compensate_on_action_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// The transition ran and the saga was persisted.
    Applied { state: String, completed: bool },
    /// The event had no correlation id.
    IgnoredMissingCorrelation,
    /// The saga's current state has no outgoing transitions.
    IgnoredUnknownState,
    /// No transition in the current state matches the event type.
    IgnoredNoTransition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaMetricsSnapshot {
    pub applied: u64,
    pub ignored: u64,
    pub conflicts: u64,
    pub completed: u64,
}

pub struct SagaOrchestrator<S> {
    definition: Arc<StateMachineDefinition<S>>,
    repository: Arc<dyn SagaRepository<S>>,
    extractor: Option<CorrelationExtractor>,
    config: SagaOrchestratorConfig,
    /// Per-instance compensation stacks. Compensations are closures, so
    /// they live with the orchestrator, not the repository.
    compensations: DashMap<String, CompensationStack>,
    applied: AtomicU64,
    ignored: AtomicU64,
    conflicts: AtomicU64,
    completed: AtomicU64,
}

impl<S> SagaOrchestrator<S>
where
    S: Default + Clone + Send + Sync + 'static,
{
    pub fn new(
        definition: Arc<StateMachineDefinition<S>>,
        repository: Arc<dyn SagaRepository<S>>,
    ) -> Self {
        Self::with_config(definition, repository, SagaOrchestratorConfig::default())
    }

    pub fn with_config(
        definition: Arc<StateMachineDefinition<S>>,
        repository: Arc<dyn SagaRepository<S>>,
        config: SagaOrchestratorConfig,
    ) -> Self {
        Self {
            definition,
            repository,
            extractor: None,
            config,
            compensations: DashMap::new(),
            applied: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn with_correlation_extractor(mut self, extractor: CorrelationExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    fn correlation_of(&self, event: &dyn Message) -> Option<String> {
        event
            .header()
            .correlation_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| self.extractor.as_ref().and_then(|extract| extract(event)))
    }

    /// Route one event. Returns how the event was applied or why it was
    /// ignored; version conflicts are retried internally with fresh
    /// state.
    pub async fn handle_event(&self, event: Arc<dyn Message>) -> qv_common::Result<SagaOutcome> {
        let Some(correlation_id) = self.correlation_of(event.as_ref()) else {
            warn!(
                event_type = event.type_name(),
                "event carries no correlation id, ignoring"
            );
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return Ok(SagaOutcome::IgnoredMissingCorrelation);
        };

        let mut attempt = 0;
        loop {
            match self.dispatch_once(&correlation_id, event.clone()).await {
                Err(QuiverError::SagaConcurrency { expected, actual, .. })
                    if attempt < self.config.conflict_retries =>
                {
                    attempt += 1;
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        %correlation_id,
                        expected,
                        actual,
                        attempt,
                        "version conflict, retrying dispatch"
                    );
                }
                Ok(outcome) => {
                    match &outcome {
                        SagaOutcome::Applied { completed, .. } => {
                            self.applied.fetch_add(1, Ordering::Relaxed);
                            if *completed {
                                self.completed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ => {
                            self.ignored.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    return Ok(outcome);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn dispatch_once(
        &self,
        correlation_id: &str,
        event: Arc<dyn Message>,
    ) -> qv_common::Result<SagaOutcome> {
        let (mut saga, is_new) = match self.repository.find(correlation_id).await? {
            Some(saga) => (saga, false),
            None => (
                Saga::new(correlation_id, self.definition.initial_state()),
                true,
            ),
        };

        if self
            .definition
            .transitions_for(&saga.current_state)
            .is_none()
        {
            debug!(
                %correlation_id,
                state = %saga.current_state,
                event_type = event.type_name(),
                "no transitions from current state, event ignored"
            );
            return Ok(SagaOutcome::IgnoredUnknownState);
        }

        let Some(transition) = self
            .definition
            .select(&saga.current_state, event.as_any().type_id())
            .cloned()
        else {
            debug!(
                %correlation_id,
                state = %saga.current_state,
                event_type = event.type_name(),
                "no transition matches event type, event ignored"
            );
            return Ok(SagaOutcome::IgnoredNoTransition);
        };

        // The instance's compensation stack is taken for the duration of
        // the transition and restored afterwards
        let mut stack = self
            .compensations
            .remove(correlation_id)
            .map(|(_, stack)| stack)
            .unwrap_or_default();
        let depth_before_action = stack.len();

        if let Some(action) = &transition.action {
            let mut ctx = StateContext {
                saga: &mut saga,
                event: event.as_ref(),
                compensation: &mut stack,
            };
            if let Err(action_error) = action.run(&mut ctx).await {
                warn!(
                    %correlation_id,
                    trigger = transition.trigger_name,
                    %action_error,
                    "transition action failed"
                );
                if self.config.compensate_on_action_error {
                    if let Err(compensation_error) = stack.compensate(false).await {
                        warn!(%correlation_id, %compensation_error, "compensation after action failure");
                    }
                }
                self.compensations
                    .insert(correlation_id.to_string(), stack);
                return Err(action_error);
            }
        }

        if let Some(to_state) = &transition.to_state {
            debug!(
                %correlation_id,
                from = %saga.current_state,
                to = %to_state,
                trigger = transition.trigger_name,
                "saga transition"
            );
            saga.current_state = to_state.clone();
        }
        if transition.finalize {
            saga.is_completed = true;
        }

        let persisted = if is_new {
            self.repository.save(saga).await
        } else {
            self.repository.update(saga).await
        };

        match persisted {
            Ok(stored) => {
                if stored.is_completed {
                    info!(%correlation_id, state = %stored.current_state, "saga completed");
                    // Completed instances drop their remaining compensations
                } else {
                    self.compensations
                        .insert(correlation_id.to_string(), stack);
                }
                Ok(SagaOutcome::Applied {
                    state: stored.current_state,
                    completed: stored.is_completed,
                })
            }
            Err(persist_error) => {
                // Undo this attempt's registrations so a conflict retry
                // does not duplicate them
                stack.truncate(depth_before_action);
                self.compensations
                    .insert(correlation_id.to_string(), stack);
                Err(persist_error)
            }
        }
    }

    /// Stale, non-completed instances older than the horizon. The caller
    /// decides what a timeout means (cancellation event, escalation).
    pub async fn find_stale(&self, older_than: Duration) -> qv_common::Result<Vec<Saga<S>>> {
        self.repository.find_stale(older_than).await
    }

    pub fn metrics(&self) -> SagaMetricsSnapshot {
        SagaMetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}
